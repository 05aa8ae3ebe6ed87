use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::data::store::DEFAULT_DUPLICATE_WINDOW;
use crate::error::WatchError;
use crate::notification::types::ThresholdPct;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub notification: NotificationConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub threshold_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_source_path")]
    pub source_path: String,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            source_path: default_source_path(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// Mirror target for the signal snapshot (trading terminal's files folder).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TerminalConfig {
    #[serde(default)]
    pub echo_dir: Option<String>,
}

fn default_retention_days() -> u32 { 30 }
fn default_duplicate_window() -> usize { DEFAULT_DUPLICATE_WINDOW }
fn default_interval() -> u64 { 300 }
fn default_source_path() -> String { "inbox/observations.json".to_string() }
fn default_maintenance_interval() -> u64 { 3600 }

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub config_path: String,
    pub data_dir: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(dir) = &env.data_dir {
            self.storage.data_dir = dir.clone();
        }
    }

    /// Rejects values no component may start with.
    pub fn validate(&self) -> Result<(), WatchError> {
        self.threshold()?;
        if self.storage.data_dir.trim().is_empty() {
            return Err(WatchError::ConfigurationError("storage.data_dir is empty".into()));
        }
        if self.storage.duplicate_window == 0 {
            return Err(WatchError::ConfigurationError(
                "storage.duplicate_window must be at least 1".into(),
            ));
        }
        if self.cycle.interval_secs == 0 || self.cycle.maintenance_interval_secs == 0 {
            return Err(WatchError::ConfigurationError(
                "cycle intervals must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn threshold(&self) -> Result<ThresholdPct, WatchError> {
        ThresholdPct::new(self.notification.threshold_pct)
    }

    pub fn observations_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join("observations")
    }

    pub fn changes_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join("changes")
    }

    pub fn echo_dir(&self) -> Option<PathBuf> {
        self.terminal
            .echo_dir
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.storage.retention_days))
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            config_path: std::env::var("SENTIMENT_WATCH_CONFIG")
                .unwrap_or_else(|_| "config.toml".to_string()),
            data_dir: std::env::var("SENTIMENT_WATCH_DATA_DIR").ok(),
        })
    }
}
