use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::data::codec::decode_tolerant;
use crate::data::files;
use crate::data::types::{instrument_key, Signal};
use crate::error::{Result, WatchError};
use crate::notification::types::{LastSentSignal, ThresholdPct, LAST_SENT_HEADER};

pub const LAST_SENT_FILE: &str = "lastsent.dat";

/// Absorbs float noise on two-decimal percentages at the threshold boundary.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// Anti-spam gate: decides whether an observation is worth notifying given
/// what was last actually sent for its instrument.
///
/// The gate never looks at transition importance. A signal that repeats the
/// last notified one is always suppressed, and a changed signal must also
/// move the value by at least the threshold.
pub struct NotificationGate {
    path: PathBuf,
    state: Mutex<HashMap<String, LastSentSignal>>,
}

impl NotificationGate {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LAST_SENT_FILE),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Restores the last-sent table; malformed lines are skipped and the
    /// newest entry wins if an instrument appears twice.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let gate = Self::new(dir);
        let lines = files::read_body(&gate.path, LAST_SENT_HEADER)
            .map_err(|e| WatchError::storage(&gate.path, e))?;

        let entries = decode_tolerant(&lines, LAST_SENT_FILE, LastSentSignal::decode);
        {
            let mut state = gate.state.lock();
            for entry in entries {
                match state.get(&entry.instrument) {
                    Some(existing) if existing.sent_time > entry.sent_time => {}
                    _ => {
                        state.insert(entry.instrument.clone(), entry);
                    }
                }
            }
            info!(path = %gate.path.display(), instruments = state.len(), "last-sent table loaded");
        }
        Ok(gate)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn should_send(
        &self,
        instrument: &str,
        signal: Signal,
        value: f64,
        threshold: ThresholdPct,
    ) -> bool {
        let key = match instrument_key(instrument) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "gate refused unkeyable instrument");
                return false;
            }
        };

        let state = self.state.lock();
        let Some(last) = state.get(&key) else {
            debug!(instrument = %key, "first notification for instrument");
            return true;
        };

        if last.signal == signal {
            return false;
        }

        let moved = (value - last.buy_pct).abs();
        let send = moved + THRESHOLD_EPSILON >= threshold.value();
        debug!(
            instrument = %key,
            from = %last.signal,
            to = %signal,
            moved,
            threshold = threshold.value(),
            send,
            "gate decision"
        );
        send
    }

    /// To be called only after the notifier confirmed delivery.
    pub fn record_sent(&self, instrument: &str, signal: Signal, value: f64) {
        self.record_sent_at(instrument, signal, value, Utc::now());
    }

    pub fn record_sent_at(&self, instrument: &str, signal: Signal, value: f64, sent_time: DateTime<Utc>) {
        let key = match instrument_key(instrument) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "sent state not recorded");
                return;
            }
        };

        let mut state = self.state.lock();
        state.insert(
            key.clone(),
            LastSentSignal {
                instrument: key.clone(),
                signal,
                buy_pct: value,
                sent_time: sent_time.trunc_subsecs(0),
            },
        );
        // in-memory state stays authoritative even if the rewrite fails
        if let Err(e) = self.write_table(&state) {
            warn!(instrument = %key, path = %self.path.display(), error = %e, "failed to persist last-sent table");
        }
    }

    pub fn last_sent(&self, instrument: &str) -> Option<LastSentSignal> {
        let key = instrument_key(instrument).ok()?;
        self.state.lock().get(&key).cloned()
    }

    /// Forgets entries sent before `cutoff`; returns how many were dropped.
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let before = state.len();
        state.retain(|_, entry| entry.sent_time >= cutoff);
        let removed = before - state.len();

        if removed > 0 {
            if let Err(e) = self.write_table(&state) {
                warn!(path = %self.path.display(), error = %e, "failed to persist last-sent table");
            }
            info!(removed, cutoff = %cutoff, "stale last-sent entries removed");
        }
        removed
    }

    fn write_table(&self, state: &HashMap<String, LastSentSignal>) -> std::io::Result<()> {
        let mut entries: Vec<&LastSentSignal> = state.values().collect();
        entries.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        let lines: Vec<String> = entries.into_iter().map(LastSentSignal::encode).collect();
        files::rewrite_atomically(&self.path, LAST_SENT_HEADER, &lines)
    }
}
