//! Line codec for every `.dat` file: `;`-separated fields, one record per
//! line, preceded by a header line naming the schema.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use crate::data::types::{Observation, Signal};
use crate::error::{Result, WatchError};

pub const SEPARATOR: char = ';';
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const OBSERVATION_HEADER: &str = "timestamp;buyPct;sellPct;signal";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(field: &str, line: &str) -> Result<DateTime<Utc>> {
    let field = field.trim();
    if field.is_empty() {
        return Err(WatchError::malformed(line, "missing timestamp"));
    }
    NaiveDateTime::parse_from_str(field, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| WatchError::malformed(line, format!("bad timestamp {field:?}: {e}")))
}

pub fn format_pct(value: f64) -> String {
    format!("{value:.2}")
}

pub fn parse_pct(field: &str, name: &str, line: &str) -> Result<f64> {
    field
        .trim()
        .parse::<f64>()
        .map_err(|e| WatchError::malformed(line, format!("bad {name} {field:?}: {e}")))
}

pub fn parse_signal(field: &str, line: &str) -> Result<Signal> {
    field
        .parse::<Signal>()
        .map_err(|_| WatchError::malformed(line, format!("bad signal {field:?}")))
}

/// Splits a record line, requiring between `min` and `max` fields.
pub fn split_fields(line: &str, min: usize, max: usize) -> Result<Vec<&str>> {
    let fields: Vec<&str> = line.split(SEPARATOR).collect();
    if fields.len() < min || fields.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}..={max}")
        };
        return Err(WatchError::malformed(
            line,
            format!("expected {expected} fields, found {}", fields.len()),
        ));
    }
    Ok(fields)
}

/// `timestamp;buyPct;sellPct;signal`. The instrument is implied by the file.
pub fn encode_observation(obs: &Observation) -> String {
    format!(
        "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
        format_timestamp(&obs.timestamp),
        format_pct(obs.buy_pct),
        format_pct(obs.sell_pct),
        obs.signal
    )
}

pub fn decode_observation(instrument: &str, line: &str) -> Result<Observation> {
    let fields = split_fields(line, 4, 4)?;
    Ok(Observation {
        instrument: instrument.to_string(),
        timestamp: parse_timestamp(fields[0], line)?,
        buy_pct: parse_pct(fields[1], "buyPct", line)?,
        sell_pct: parse_pct(fields[2], "sellPct", line)?,
        signal: parse_signal(fields[3], line)?,
    })
}

/// Decodes every line, skipping (and logging) the ones that fail.
pub fn decode_tolerant<T, F>(lines: &[String], source: &str, decode: F) -> Vec<T>
where
    F: Fn(&str) -> Result<T>,
{
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match decode(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(source, error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Observation {
        Observation::new(
            "EURUSD",
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
            61.5,
            38.5,
            Signal::Buy,
        )
    }

    #[test]
    fn test_encode_observation_layout() {
        assert_eq!(
            encode_observation(&sample()),
            "2024-03-01 12:30:05;61.50;38.50;BUY"
        );
    }

    #[test]
    fn test_decode_observation() {
        let obs = decode_observation("EURUSD", "2024-03-01 12:30:05;61.50;38.50;BUY").unwrap();
        assert_eq!(obs, sample());
    }

    #[test]
    fn test_decode_rejects_missing_timestamp() {
        let err = decode_observation("EURUSD", ";61.50;38.50;BUY").unwrap_err();
        assert!(err.to_string().contains("missing timestamp"));
    }

    #[test]
    fn test_decode_rejects_wrong_field_count() {
        assert!(decode_observation("EURUSD", "2024-03-01 12:30:05;61.50;BUY").is_err());
        assert!(decode_observation("EURUSD", "timestamp;buyPct;sellPct;signal").is_err());
    }

    #[test]
    fn test_decode_tolerant_skips_bad_lines() {
        let lines = vec![
            "2024-03-01 12:30:05;61.50;38.50;BUY".to_string(),
            "garbage".to_string(),
            String::new(),
            "2024-03-01 12:35:05;40.00;60.00;SELL".to_string(),
        ];
        let decoded = decode_tolerant(&lines, "test", |l| decode_observation("EURUSD", l));
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].signal, Signal::Sell);
    }
}
