use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::data::types::Observation;

/// Producer of one batch of fresh observations per refresh cycle.
pub trait ObservationSource: Send + Sync {
    fn fetch(&self) -> Result<Vec<Observation>>;

    fn name(&self) -> &'static str;
}

/// Reads the JSON array of observations the external scraper drops on disk.
/// A missing file is an empty batch.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ObservationSource for JsonFileSource {
    fn fetch(&self) -> Result<Vec<Observation>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no observation drop file");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read observations: {}", self.path.display()))
            }
        };

        let observations: Vec<Observation> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse observations: {}", self.path.display()))?;

        Ok(observations
            .into_iter()
            .map(|o| Observation::new(o.instrument, o.timestamp, o.buy_pct, o.sell_pct, o.signal))
            .collect())
    }

    fn name(&self) -> &'static str {
        "json-file"
    }
}
