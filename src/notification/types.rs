use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::codec::{
    format_pct, format_timestamp, parse_pct, parse_signal, parse_timestamp, split_fields,
    SEPARATOR,
};
use crate::data::types::{instrument_key, Signal};
use crate::error::{Result, WatchError};

pub const LAST_SENT_HEADER: &str = "instrument;signal;buyPct;sentTime";

/// Minimum move, in percentage points, a changed signal must show against
/// the last notified value before another notification goes out.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct ThresholdPct(f64);

impl ThresholdPct {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(WatchError::ConfigurationError(format!(
                "threshold must be a finite percentage, got {value}"
            )));
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(WatchError::ConfigurationError(format!(
                "threshold must be within 0..=100 percent, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for ThresholdPct {
    type Error = WatchError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

/// The most recent observation actually notified for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastSentSignal {
    pub instrument: String,
    pub signal: Signal,
    pub buy_pct: f64,
    pub sent_time: DateTime<Utc>,
}

impl LastSentSignal {
    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.instrument,
            self.signal,
            format_pct(self.buy_pct),
            format_timestamp(&self.sent_time)
        )
    }

    pub fn decode(line: &str) -> Result<Self> {
        let fields = split_fields(line, 4, 4)?;
        Ok(Self {
            instrument: instrument_key(fields[0])
                .map_err(|_| WatchError::malformed(line, "missing instrument"))?,
            signal: parse_signal(fields[1], line)?,
            buy_pct: parse_pct(fields[2], "buyPct", line)?,
            sent_time: parse_timestamp(fields[3], line)?,
        })
    }
}
