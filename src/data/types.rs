use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchError};

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("static regex"));

/// Categorical trading state of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Neutral,
    Unknown,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Neutral => "NEUTRAL",
            Signal::Unknown => "UNKNOWN",
        }
    }

    /// BUY or SELL.
    pub fn is_directional(&self) -> bool {
        matches!(self, Signal::Buy | Signal::Sell)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Signal::Buy),
            "SELL" => Ok(Signal::Sell),
            "NEUTRAL" => Ok(Signal::Neutral),
            "UNKNOWN" => Ok(Signal::Unknown),
            other => Err(WatchError::malformed(s, format!("unknown signal {other:?}"))),
        }
    }
}

/// One sentiment reading for one instrument at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub buy_pct: f64,
    pub sell_pct: f64,
    pub signal: Signal,
}

impl Observation {
    /// Builds an observation, truncating the timestamp to whole seconds.
    pub fn new(
        instrument: impl Into<String>,
        timestamp: DateTime<Utc>,
        buy_pct: f64,
        sell_pct: f64,
        signal: Signal,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp: timestamp.trunc_subsecs(0),
            buy_pct,
            sell_pct,
            signal,
        }
    }

    /// Filesystem-safe partition key of the observation's instrument.
    pub fn key(&self) -> Result<String> {
        instrument_key(&self.instrument)
    }

    /// Percentages must be finite and non-negative.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        for (name, value) in [("buyPct", self.buy_pct), ("sellPct", self.sell_pct)] {
            if !value.is_finite() {
                return Err(format!("{name} is not finite"));
            }
            if value < 0.0 {
                return Err(format!("{name} is negative ({value})"));
            }
        }
        Ok(())
    }

    /// Buy/sell shares rescaled so they sum to 100.
    pub fn normalized_pcts(&self) -> (f64, f64) {
        let total = self.buy_pct + self.sell_pct;
        if total <= 0.0 || !total.is_finite() {
            return (0.0, 0.0);
        }
        (self.buy_pct * 100.0 / total, self.sell_pct * 100.0 / total)
    }
}

/// Normalizes an instrument identifier into the key shared by every on-disk
/// namespace: runs of non-alphanumerics become one `_`, edges are trimmed and
/// the result is uppercased.
pub fn instrument_key(instrument: &str) -> Result<String> {
    let collapsed = NON_ALPHANUMERIC.replace_all(instrument, "_");
    let key = collapsed.trim_matches('_').to_ascii_uppercase();
    if key.is_empty() {
        return Err(WatchError::InvalidInstrument(instrument.to_string()));
    }
    Ok(key)
}
