use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::data::codec::{decode_observation, decode_tolerant, encode_observation, OBSERVATION_HEADER};
use crate::data::files;
use crate::data::types::{instrument_key, Observation};
use crate::error::{Result, WatchError};

pub const OBSERVATION_SUFFIX: &str = ".dat";
pub const DEFAULT_DUPLICATE_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    /// Byte-identical to one of the last `duplicate_window` records.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: usize,
    pub duplicates: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub instruments: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentValidation {
    pub instrument: String,
    pub records: usize,
    pub invalid: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentStats {
    pub instrument: String,
    pub records: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// Append-only, per-instrument observation files under one directory.
///
/// Every write to an instrument's file (append, prune) happens under that
/// instrument's own lock; different instruments never contend.
pub struct ObservationStore {
    dir: PathBuf,
    duplicate_window: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ObservationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            locks: DashMap::new(),
        }
    }

    /// Number of trailing records inspected for duplicate suppression.
    pub fn with_duplicate_window(mut self, window: usize) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{OBSERVATION_SUFFIX}"))
    }

    /// Lock for one normalized key, created on first use.
    pub(crate) fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn storage_error(&self, key: &str, path: &Path, e: io::Error) -> WatchError {
        error!(instrument = key, path = %path.display(), error = %e, "observation storage failure");
        WatchError::storage(path, e)
    }

    pub fn append(&self, obs: &Observation) -> Result<AppendOutcome> {
        let key = obs.key()?;
        obs.check_consistency()
            .map_err(|reason| WatchError::InvalidObservation {
                instrument: obs.instrument.clone(),
                reason,
            })?;

        let path = self.path_for(&key);
        let line = encode_observation(obs);

        let lock = self.key_lock(&key);
        let _guard = lock.lock();

        let recent = files::read_tail(&path, OBSERVATION_HEADER, self.duplicate_window)
            .map_err(|e| self.storage_error(&key, &path, e))?;
        if recent.iter().any(|l| *l == line) {
            debug!(instrument = %key, "duplicate observation skipped");
            return Ok(AppendOutcome::Duplicate);
        }

        files::append_lines(&path, OBSERVATION_HEADER, &[line], |l| {
            decode_observation(&key, l).is_ok()
        })
        .map_err(|e| self.storage_error(&key, &path, e))?;

        Ok(AppendOutcome::Written)
    }

    /// Appends each observation independently; failures are counted, never
    /// propagated, so one instrument cannot stop the rest of the batch.
    pub fn append_batch(&self, observations: &[Observation]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for obs in observations {
            match self.append(obs) {
                Ok(AppendOutcome::Written) => outcome.written += 1,
                Ok(AppendOutcome::Duplicate) => outcome.duplicates += 1,
                Err(e) => {
                    warn!(instrument = %obs.instrument, error = %e, "observation not stored");
                    outcome.failed += 1;
                }
            }
        }
        info!(
            written = outcome.written,
            duplicates = outcome.duplicates,
            failed = outcome.failed,
            "observation batch stored"
        );
        outcome
    }

    pub fn read_all(&self, instrument: &str) -> Result<Vec<Observation>> {
        let key = instrument_key(instrument)?;
        let path = self.path_for(&key);
        let lines = files::read_body(&path, OBSERVATION_HEADER)
            .map_err(|e| self.storage_error(&key, &path, e))?;
        Ok(decode_tolerant(&lines, &key, |l| decode_observation(&key, l)))
    }

    pub fn read_last(&self, instrument: &str, n: usize) -> Result<Vec<Observation>> {
        let key = instrument_key(instrument)?;
        let path = self.path_for(&key);
        let lines = files::read_tail(&path, OBSERVATION_HEADER, n)
            .map_err(|e| self.storage_error(&key, &path, e))?;
        Ok(decode_tolerant(&lines, &key, |l| decode_observation(&key, l)))
    }

    /// Normalized keys of every instrument with a file in the store, sorted.
    pub fn list_instruments(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WatchError::storage(&self.dir, e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| WatchError::storage(&self.dir, e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name.strip_suffix(OBSERVATION_SUFFIX) {
                if !key.is_empty() && !key.starts_with('.') {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Drops every record older than `cutoff`, instrument by instrument.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        for key in self.list_instruments()? {
            report.instruments += 1;
            match self.prune_instrument(&key, cutoff) {
                Ok(removed) => report.removed += removed,
                Err(e) => {
                    warn!(instrument = %key, error = %e, "prune failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            instruments = report.instruments,
            removed = report.removed,
            failed = report.failed,
            cutoff = %cutoff,
            "observation retention applied"
        );
        Ok(report)
    }

    fn prune_instrument(&self, key: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let path = self.path_for(key);
        let lock = self.key_lock(key);
        let _guard = lock.lock();

        let lines = files::read_body(&path, OBSERVATION_HEADER)
            .map_err(|e| self.storage_error(key, &path, e))?;
        // undecodable lines are carried through for validate() to report
        let (kept, dropped): (Vec<String>, Vec<String>) = lines.into_iter().partition(|line| {
            decode_observation(key, line).map_or(true, |obs| obs.timestamp >= cutoff)
        });
        let removed = dropped.len();

        if removed == 0 {
            return Ok(0);
        }
        files::rewrite_atomically(&path, OBSERVATION_HEADER, &kept)
            .map_err(|e| self.storage_error(key, &path, e))?;

        debug!(instrument = key, removed, kept = kept.len(), "instrument pruned");
        Ok(removed)
    }

    /// Per-instrument record counts and how many records fail decoding or
    /// the percentage consistency check.
    pub fn validate(&self) -> Result<Vec<InstrumentValidation>> {
        let mut report = Vec::new();
        for key in self.list_instruments()? {
            let path = self.path_for(&key);
            let lines = match files::read_body(&path, OBSERVATION_HEADER) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(instrument = %key, error = %e, "validation skipped");
                    continue;
                }
            };
            let invalid = lines
                .iter()
                .filter(|l| match decode_observation(&key, l) {
                    Ok(obs) => obs.check_consistency().is_err(),
                    Err(_) => true,
                })
                .count();
            if invalid > 0 {
                warn!(instrument = %key, invalid, records = lines.len(), "inconsistent records found");
            }
            report.push(InstrumentValidation {
                instrument: key,
                records: lines.len(),
                invalid,
            });
        }
        Ok(report)
    }

    pub fn stats(&self, instrument: &str) -> Result<InstrumentStats> {
        let records = self.read_all(instrument)?;
        Ok(InstrumentStats {
            instrument: instrument_key(instrument)?,
            records: records.len(),
            first: records.iter().map(|o| o.timestamp).min(),
            last: records.iter().map(|o| o.timestamp).max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::Signal;
    use chrono::{Duration, TimeZone};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn obs(instrument: &str, minute: i64, buy: f64, signal: Signal) -> Observation {
        Observation::new(instrument, at(minute), buy, 100.0 - buy, signal)
    }

    #[test]
    fn test_duplicate_append_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path().join("observations"));
        let x = obs("EURUSD", 0, 60.0, Signal::Buy);

        assert_eq!(store.append(&x).unwrap(), AppendOutcome::Written);
        assert_eq!(store.append(&x).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(store.read_all("EURUSD").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_outside_window_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path()).with_duplicate_window(2);
        let first = obs("EURUSD", 0, 60.0, Signal::Buy);

        store.append(&first).unwrap();
        store.append(&obs("EURUSD", 1, 61.0, Signal::Buy)).unwrap();
        store.append(&obs("EURUSD", 2, 62.0, Signal::Buy)).unwrap();

        assert_eq!(store.append(&first).unwrap(), AppendOutcome::Written);
        assert_eq!(store.read_all("EURUSD").unwrap().len(), 4);
    }

    #[test]
    fn test_append_normalizes_instrument_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());

        store.append(&obs("eur/usd", 0, 55.0, Signal::Buy)).unwrap();

        assert!(dir.path().join("EUR_USD.dat").exists());
        assert_eq!(store.read_all("EUR-USD").unwrap().len(), 1);
        let contents = fs::read_to_string(dir.path().join("EUR_USD.dat")).unwrap();
        assert!(contents.starts_with(OBSERVATION_HEADER));
    }

    #[test]
    fn test_append_rejects_negative_percentages() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        let bad = Observation::new("EURUSD", at(0), -5.0, 50.0, Signal::Buy);

        assert!(matches!(
            store.append(&bad),
            Err(WatchError::InvalidObservation { .. })
        ));
        assert!(store.list_instruments().unwrap().is_empty());
    }

    #[test]
    fn test_batch_reports_partial_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        let a = obs("EURUSD", 0, 60.0, Signal::Buy);
        let batch = vec![
            a.clone(),
            a,
            Observation::new("///", at(0), 50.0, 50.0, Signal::Neutral),
            obs("GBPUSD", 0, 30.0, Signal::Sell),
        ];

        let outcome = store.append_batch(&batch);
        assert_eq!(
            outcome,
            BatchOutcome {
                written: 2,
                duplicates: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_read_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        fs::write(
            dir.path().join("EURUSD.dat"),
            format!(
                "{OBSERVATION_HEADER}\n2024-05-01 08:00:00;60.00;40.00;BUY\nnot a record\n2024-05-01 08:05:00;40.00;60.00;SELL\n"
            ),
        )
        .unwrap();

        let all = store.read_all("EURUSD").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].signal, Signal::Sell);

        let last = store.read_last("EURUSD", 1).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].timestamp, at(5));
    }

    #[test]
    fn test_list_instruments_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        assert!(store.list_instruments().unwrap().is_empty());

        store.append(&obs("GBPUSD", 0, 50.0, Signal::Neutral)).unwrap();
        store.append(&obs("EURUSD", 0, 50.0, Signal::Neutral)).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("EURUSD.dat.tmp"), "x").unwrap();

        assert_eq!(store.list_instruments().unwrap(), vec!["EURUSD", "GBPUSD"]);
    }

    #[test]
    fn test_prune_keeps_records_at_or_after_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        for minute in 0..10 {
            store.append(&obs("EURUSD", minute, 50.0 + minute as f64, Signal::Buy)).unwrap();
            store.append(&obs("USDJPY", minute, 40.0, Signal::Sell)).unwrap();
        }
        let before: usize = ["EURUSD", "USDJPY"]
            .iter()
            .map(|i| store.read_all(i).unwrap().len())
            .sum();

        let cutoff = at(6);
        let report = store.prune_older_than(cutoff).unwrap();

        let mut after = 0;
        for instrument in store.list_instruments().unwrap() {
            let records = store.read_all(&instrument).unwrap();
            assert!(records.iter().all(|o| o.timestamp >= cutoff));
            after += records.len();
        }
        assert_eq!(report.instruments, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.removed, before - after);
        assert_eq!(after, 8);
    }

    #[test]
    fn test_prune_carries_malformed_lines_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        fs::write(
            dir.path().join("EURUSD.dat"),
            format!(
                "{OBSERVATION_HEADER}\n2024-05-01 08:00:00;60.00;40.00;BUY\nnot-a-record\n2024-05-01 08:10:00;55.00;45.00;BUY\n"
            ),
        )
        .unwrap();

        let report = store.prune_older_than(at(5)).unwrap();

        assert_eq!(report.removed, 1);
        let contents = fs::read_to_string(dir.path().join("EURUSD.dat")).unwrap();
        assert!(contents.contains("not-a-record"));
        assert!(!contents.contains("08:00:00"));
        assert_eq!(store.read_all("EURUSD").unwrap().len(), 1);
        assert_eq!(
            store.validate().unwrap(),
            vec![InstrumentValidation {
                instrument: "EURUSD".into(),
                records: 2,
                invalid: 1
            }]
        );
    }

    #[test]
    fn test_validate_counts_inconsistent_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        store.append(&obs("EURUSD", 0, 60.0, Signal::Buy)).unwrap();
        fs::write(
            dir.path().join("GBPUSD.dat"),
            format!(
                "{OBSERVATION_HEADER}\n2024-05-01 08:00:00;-3.00;40.00;BUY\n;50.00;50.00;NEUTRAL\n2024-05-01 08:05:00;40.00;60.00;SELL\n"
            ),
        )
        .unwrap();

        let report = store.validate().unwrap();
        assert_eq!(
            report,
            vec![
                InstrumentValidation {
                    instrument: "EURUSD".into(),
                    records: 1,
                    invalid: 0
                },
                InstrumentValidation {
                    instrument: "GBPUSD".into(),
                    records: 3,
                    invalid: 2
                },
            ]
        );
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path());
        for minute in [3, 1, 7] {
            store.append(&obs("EURUSD", minute, 50.0, Signal::Neutral)).unwrap();
        }

        let stats = store.stats("eurusd").unwrap();
        assert_eq!(stats.instrument, "EURUSD");
        assert_eq!(stats.records, 3);
        assert_eq!(stats.first, Some(at(1)));
        assert_eq!(stats.last, Some(at(7)));
    }

    #[test]
    fn test_instruments_do_not_block_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObservationStore::new(dir.path()));

        // simulate a slow writer on EURUSD
        let held = store.key_lock("EURUSD");
        let guard = held.lock();

        let (tx, rx) = mpsc::channel();
        let other = {
            let store = Arc::clone(&store);
            let tx = tx.clone();
            thread::spawn(move || {
                store.append(&obs("GBPUSD", 0, 50.0, Signal::Neutral)).unwrap();
                tx.send("GBPUSD").unwrap();
            })
        };
        let same = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store.append(&obs("EURUSD", 0, 50.0, Signal::Neutral)).unwrap();
                tx.send("EURUSD").unwrap();
            })
        };

        assert_eq!(rx.recv_timeout(StdDuration::from_secs(5)).unwrap(), "GBPUSD");
        assert!(rx.recv_timeout(StdDuration::from_millis(200)).is_err());

        drop(guard);
        assert_eq!(rx.recv_timeout(StdDuration::from_secs(5)).unwrap(), "EURUSD");
        other.join().unwrap();
        same.join().unwrap();
    }

    #[test]
    fn test_concurrent_appends_same_instrument_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObservationStore::new(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        let minute = t * 50 + i;
                        store.append(&obs("EURUSD", minute, 50.0, Signal::Buy)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let path = dir.path().join("EURUSD.dat");
        let body = files::read_body(&path, OBSERVATION_HEADER).unwrap();
        assert_eq!(body.len(), 400);
        assert!(body.iter().all(|l| decode_observation("EURUSD", l).is_ok()));
        let headers = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .filter(|l| *l == OBSERVATION_HEADER)
            .count();
        assert_eq!(headers, 1);
    }
}
