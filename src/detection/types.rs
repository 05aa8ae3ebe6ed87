use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::data::codec::{
    format_pct, format_timestamp, parse_pct, parse_signal, parse_timestamp, split_fields,
    SEPARATOR,
};
use crate::data::types::{instrument_key, Signal};
use crate::error::{Result, WatchError};

pub const HISTORY_HEADER: &str = "instrument;fromSignal;toSignal;changeTime;fromBuyPct;toBuyPct";
pub const SNAPSHOT_HEADER: &str = "instrument;lastSignal;lastBuyPct";

/// Urgency of a signal change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

impl Importance {
    /// BUY<->SELL is critical, BUY/SELL<->NEUTRAL is high, anything else
    /// (UNKNOWN on either side) is medium. `Low` is never assigned here.
    pub fn classify(from: Signal, to: Signal) -> Self {
        match (from, to) {
            (Signal::Buy, Signal::Sell) | (Signal::Sell, Signal::Buy) => Importance::Critical,
            (a, Signal::Neutral) | (Signal::Neutral, a) if a.is_directional() => Importance::High,
            _ => Importance::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Low => "LOW",
            Importance::Medium => "MEDIUM",
            Importance::High => "HIGH",
            Importance::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freshness bucket of a transition, computed at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Actuality {
    VeryRecent,
    Recent,
    ThisWeek,
    Older,
}

impl Actuality {
    pub fn classify(change_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let age = now.signed_duration_since(change_time);
        if age < Duration::hours(4) {
            Actuality::VeryRecent
        } else if change_time.date_naive() == now.date_naive() {
            Actuality::Recent
        } else if age < Duration::days(7) {
            Actuality::ThisWeek
        } else {
            Actuality::Older
        }
    }
}

/// A change of signal between two consecutive observations of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub instrument: String,
    pub from_signal: Signal,
    pub to_signal: Signal,
    pub change_time: DateTime<Utc>,
    pub from_buy_pct: f64,
    pub to_buy_pct: f64,
    pub importance: Importance,
}

impl TransitionEvent {
    /// `None` when the signal did not change.
    pub fn new(
        instrument: impl Into<String>,
        from_signal: Signal,
        to_signal: Signal,
        change_time: DateTime<Utc>,
        from_buy_pct: f64,
        to_buy_pct: f64,
    ) -> Option<Self> {
        if from_signal == to_signal {
            return None;
        }
        Some(Self {
            instrument: instrument.into(),
            from_signal,
            to_signal,
            change_time,
            from_buy_pct,
            to_buy_pct,
            importance: Importance::classify(from_signal, to_signal),
        })
    }

    pub fn actuality(&self) -> Actuality {
        self.actuality_at(Utc::now())
    }

    pub fn actuality_at(&self, now: DateTime<Utc>) -> Actuality {
        Actuality::classify(self.change_time, now)
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.instrument,
            self.from_signal,
            self.to_signal,
            format_timestamp(&self.change_time),
            format_pct(self.from_buy_pct),
            format_pct(self.to_buy_pct),
        )
    }

    /// Importance is not stored; it is re-derived from the two signals.
    pub fn decode(line: &str) -> Result<Self> {
        let fields = split_fields(line, 6, 6)?;
        let instrument = instrument_key(fields[0])
            .map_err(|_| WatchError::malformed(line, "missing instrument"))?;
        let from = parse_signal(fields[1], line)?;
        let to = parse_signal(fields[2], line)?;
        TransitionEvent::new(
            instrument,
            from,
            to,
            parse_timestamp(fields[3], line)?,
            parse_pct(fields[4], "fromBuyPct", line)?,
            parse_pct(fields[5], "toBuyPct", line)?,
        )
        .ok_or_else(|| WatchError::malformed(line, "fromSignal equals toSignal"))
    }
}

/// Last known signal of one instrument, the detector's watermark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Watermark {
    pub signal: Signal,
    /// Absent for snapshot lines written without the buy percentage column.
    pub buy_pct: Option<f64>,
}

pub fn encode_snapshot_line(instrument: &str, mark: &Watermark) -> String {
    match mark.buy_pct {
        Some(pct) => format!("{instrument}{SEPARATOR}{}{SEPARATOR}{}", mark.signal, format_pct(pct)),
        None => format!("{instrument}{SEPARATOR}{}", mark.signal),
    }
}

pub fn decode_snapshot_line(line: &str) -> Result<(String, Watermark)> {
    let fields = split_fields(line, 2, 3)?;
    let instrument = instrument_key(fields[0])
        .map_err(|_| WatchError::malformed(line, "missing instrument"))?;
    let signal = parse_signal(fields[1], line)?;
    let buy_pct = match fields.get(2).map(|f| f.trim()) {
        Some(f) if !f.is_empty() => Some(parse_pct(f, "lastBuyPct", line)?),
        _ => None,
    };
    Ok((instrument, Watermark { signal, buy_pct }))
}
