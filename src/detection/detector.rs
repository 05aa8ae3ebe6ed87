use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::data::codec::{decode_tolerant, SEPARATOR};
use crate::data::files;
use crate::data::types::{instrument_key, Observation, Signal};
use crate::detection::cache::HistoryCache;
use crate::detection::types::{
    decode_snapshot_line, encode_snapshot_line, TransitionEvent, Watermark, HISTORY_HEADER,
    SNAPSHOT_HEADER,
};
use crate::error::{Result, WatchError};

pub const HISTORY_FILE: &str = "history.dat";
pub const SNAPSHOT_FILE: &str = "snapshot.dat";
pub const MIRROR_HEADER: &str = "instrument;lastSignal";

/// `None` when `hours` reaches past the representable range: no lower bound.
fn hours_ago(hours: i64) -> Option<DateTime<Utc>> {
    Duration::try_hours(hours).and_then(|span| Utc::now().checked_sub_signed(span))
}

/// Detects signal changes per instrument against the last known signal.
///
/// One coarse lock guards the whole watermark table together with the event
/// log and snapshot writes, so concurrent batches never interleave their
/// read-modify-write cycles.
pub struct TransitionDetector {
    history_path: PathBuf,
    snapshot_path: PathBuf,
    state: Mutex<HashMap<String, Watermark>>,
    cache: HistoryCache,
}

impl TransitionDetector {
    /// A detector with no watermarks: the first observation of every
    /// instrument is never a transition.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            history_path: dir.join(HISTORY_FILE),
            snapshot_path: dir.join(SNAPSHOT_FILE),
            state: Mutex::new(HashMap::new()),
            cache: HistoryCache::new(),
        }
    }

    /// Restores watermarks from `snapshot.dat`. A missing file yields an
    /// empty table; malformed lines are skipped.
    pub fn load_snapshot(dir: impl AsRef<Path>) -> Result<Self> {
        let detector = Self::new(dir);
        let lines = files::read_body(&detector.snapshot_path, SNAPSHOT_HEADER)
            .map_err(|e| WatchError::storage(&detector.snapshot_path, e))?;

        let entries = decode_tolerant(&lines, SNAPSHOT_FILE, decode_snapshot_line);
        let count = entries.len();
        detector.state.lock().extend(entries);

        info!(
            path = %detector.snapshot_path.display(),
            instruments = count,
            "signal snapshot loaded"
        );
        Ok(detector)
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Compares each observation with its instrument's watermark, in order,
    /// and returns the transitions found.
    ///
    /// Watermarks always advance. The event log append and the snapshot
    /// rewrite are best-effort: failures are logged and the detected events
    /// are returned regardless.
    pub fn process_batch(&self, observations: &[Observation]) -> Vec<TransitionEvent> {
        let mut state = self.state.lock();
        let mut events = Vec::new();

        for obs in observations {
            let key = match obs.key() {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "observation skipped by detector");
                    continue;
                }
            };

            if let Some(previous) = state.get(&key) {
                let from_buy_pct = previous.buy_pct.unwrap_or(obs.buy_pct);
                if let Some(event) = TransitionEvent::new(
                    key.clone(),
                    previous.signal,
                    obs.signal,
                    obs.timestamp,
                    from_buy_pct,
                    obs.buy_pct,
                ) {
                    info!(
                        instrument = %key,
                        from = %event.from_signal,
                        to = %event.to_signal,
                        importance = %event.importance,
                        "signal transition detected"
                    );
                    events.push(event);
                }
            }

            state.insert(
                key,
                Watermark {
                    signal: obs.signal,
                    buy_pct: Some(obs.buy_pct),
                },
            );
        }

        if !events.is_empty() {
            let lines: Vec<String> = events.iter().map(TransitionEvent::encode).collect();
            if let Err(e) = files::append_lines(&self.history_path, HISTORY_HEADER, &lines, |l| {
                TransitionEvent::decode(l).is_ok()
            }) {
                warn!(
                    path = %self.history_path.display(),
                    error = %e,
                    events = events.len(),
                    "failed to append transition history"
                );
            }
            for event in &events {
                self.cache.push(event.clone());
            }
        }

        if let Err(e) = self.write_snapshot(&state) {
            warn!(path = %self.snapshot_path.display(), error = %e, "failed to persist signal snapshot");
        }

        debug!(
            observations = observations.len(),
            transitions = events.len(),
            "batch processed"
        );
        events
    }

    fn write_snapshot(&self, state: &HashMap<String, Watermark>) -> std::io::Result<()> {
        let mut keys: Vec<&String> = state.keys().collect();
        keys.sort();
        let lines: Vec<String> = keys
            .into_iter()
            .map(|key| encode_snapshot_line(key, &state[key]))
            .collect();
        files::rewrite_atomically(&self.snapshot_path, SNAPSHOT_HEADER, &lines)
    }

    pub fn last_known(&self, instrument: &str) -> Option<Signal> {
        let key = instrument_key(instrument).ok()?;
        self.state.lock().get(&key).map(|mark| mark.signal)
    }

    pub fn known_instruments(&self) -> usize {
        self.state.lock().len()
    }

    fn scan_history(&self) -> Result<Vec<TransitionEvent>> {
        let lines = files::read_body(&self.history_path, HISTORY_HEADER)
            .map_err(|e| WatchError::storage(&self.history_path, e))?;
        Ok(decode_tolerant(&lines, HISTORY_FILE, TransitionEvent::decode))
    }

    /// Newest-first transitions of one instrument, at most the cache capacity.
    pub fn history_for(&self, instrument: &str) -> Result<Vec<TransitionEvent>> {
        let key = instrument_key(instrument)?;
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        // serialized with process_batch so a scan never races an append+push
        let _state = self.state.lock();
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let scanned: Vec<TransitionEvent> = self
            .scan_history()?
            .into_iter()
            .filter(|e| e.instrument == key)
            .collect();
        debug!(instrument = %key, events = scanned.len(), "history loaded from event log");
        Ok(self.cache.hydrate(&key, scanned))
    }

    pub fn recent_within_hours(&self, instrument: &str, hours: i64) -> Result<Vec<TransitionEvent>> {
        let cutoff = hours_ago(hours);
        Ok(self
            .history_for(instrument)?
            .into_iter()
            .filter(|e| cutoff.map_or(true, |c| e.change_time >= c))
            .collect())
    }

    pub fn most_recent(&self, instrument: &str) -> Result<Option<TransitionEvent>> {
        Ok(self.history_for(instrument)?.into_iter().next())
    }

    /// Transitions of every instrument within the last `hours`, newest first.
    pub fn recent_changes(&self, hours: i64) -> Result<Vec<TransitionEvent>> {
        let cutoff = hours_ago(hours);
        let mut events: Vec<TransitionEvent> = self
            .scan_history()?
            .into_iter()
            .filter(|e| cutoff.map_or(true, |c| e.change_time >= c))
            .collect();
        events.reverse();
        events.sort_by(|a, b| b.change_time.cmp(&a.change_time));
        Ok(events)
    }

    /// Rewrites the event log without transitions older than `cutoff`.
    pub fn prune_history_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _state = self.state.lock();

        let events = self.scan_history()?;
        let kept: Vec<String> = events
            .iter()
            .filter(|e| e.change_time >= cutoff)
            .map(TransitionEvent::encode)
            .collect();
        let removed = events.len() - kept.len();

        if removed > 0 {
            files::rewrite_atomically(&self.history_path, HISTORY_HEADER, &kept)
                .map_err(|e| WatchError::storage(&self.history_path, e))?;
            self.cache.clear();
        }
        info!(removed, kept = kept.len(), cutoff = %cutoff, "transition history pruned");
        Ok(removed)
    }

    /// Writes the watermarks into `dir` for external consumers, using the
    /// plain `instrument;lastSignal` layout.
    pub fn sync_snapshot_to(&self, dir: &Path) -> Result<PathBuf> {
        let state = self.state.lock();

        let target = dir.join(SNAPSHOT_FILE);
        let mut keys: Vec<&String> = state.keys().collect();
        keys.sort();
        let lines: Vec<String> = keys
            .into_iter()
            .map(|key| format!("{key}{SEPARATOR}{}", state[key].signal))
            .collect();
        files::rewrite_atomically(&target, MIRROR_HEADER, &lines)
            .map_err(|e| WatchError::storage(&target, e))?;

        debug!(target = %target.display(), "signal snapshot mirrored");
        Ok(target)
    }
}
