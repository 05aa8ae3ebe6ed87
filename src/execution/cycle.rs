use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::data::store::ObservationStore;
use crate::data::types::Observation;
use crate::detection::detector::TransitionDetector;
use crate::detection::types::TransitionEvent;
use crate::notification::gate::NotificationGate;
use crate::notification::notifier::Notifier;
use crate::notification::types::ThresholdPct;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub observations: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub store_failures: usize,
    pub transitions: usize,
    pub notified: usize,
    pub suppressed: usize,
    pub notify_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned_observations: usize,
    pub pruned_transitions: usize,
    pub expired_gate_entries: usize,
    pub invalid_records: usize,
}

/// One refresh cycle: store the batch, detect transitions, then gate and
/// notify observation by observation.
pub struct RefreshCycle {
    store: Arc<ObservationStore>,
    detector: Arc<TransitionDetector>,
    gate: Arc<NotificationGate>,
    notifier: Arc<dyn Notifier>,
    threshold: ThresholdPct,
    echo_dir: Option<PathBuf>,
}

impl RefreshCycle {
    pub fn new(
        store: Arc<ObservationStore>,
        detector: Arc<TransitionDetector>,
        gate: Arc<NotificationGate>,
        notifier: Arc<dyn Notifier>,
        threshold: ThresholdPct,
    ) -> Self {
        Self {
            store,
            detector,
            gate,
            notifier,
            threshold,
            echo_dir: None,
        }
    }

    /// Directory that receives a copy of the signal snapshot after each batch.
    pub fn with_echo_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.echo_dir = dir;
        self
    }

    pub fn run(&self, batch: &[Observation]) -> CycleReport {
        let mut report = CycleReport {
            observations: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return report;
        }

        let stored = self.store.append_batch(batch);
        report.stored = stored.written;
        report.duplicates = stored.duplicates;
        report.store_failures = stored.failed;

        // observations the store rejects never move a watermark or a baseline
        let accepted: Vec<Observation> = batch
            .iter()
            .filter(|obs| match admissible(obs) {
                Ok(()) => true,
                Err(reason) => {
                    warn!(instrument = %obs.instrument, reason = %reason, "observation rejected");
                    false
                }
            })
            .cloned()
            .collect();

        let transitions = self.detector.process_batch(&accepted);
        report.transitions = transitions.len();

        if let Some(dir) = &self.echo_dir {
            if let Err(e) = self.detector.sync_snapshot_to(dir) {
                warn!(dir = %dir.display(), error = %e, "snapshot echo failed");
            }
        }

        for obs in &accepted {
            if !self
                .gate
                .should_send(&obs.instrument, obs.signal, obs.buy_pct, self.threshold)
            {
                report.suppressed += 1;
                continue;
            }

            let transition = matching_transition(&transitions, obs);
            match self.notifier.notify(obs, transition) {
                Ok(()) => {
                    self.gate.record_sent(&obs.instrument, obs.signal, obs.buy_pct);
                    report.notified += 1;
                }
                Err(e) => {
                    // baseline untouched: next cycle re-evaluates against it
                    warn!(
                        instrument = %obs.instrument,
                        notifier = self.notifier.name(),
                        error = %e,
                        "notification failed"
                    );
                    report.notify_failures += 1;
                }
            }
        }

        info!(
            observations = report.observations,
            stored = report.stored,
            transitions = report.transitions,
            notified = report.notified,
            suppressed = report.suppressed,
            failures = report.store_failures + report.notify_failures,
            "refresh cycle complete"
        );
        report
    }

    /// Applies retention to every component and validates the store.
    pub fn maintain(&self, retention: Duration) -> MaintenanceReport {
        let cutoff = Utc::now() - retention;
        let mut report = MaintenanceReport::default();

        match self.store.prune_older_than(cutoff) {
            Ok(pruned) => report.pruned_observations = pruned.removed,
            Err(e) => warn!(error = %e, "observation retention failed"),
        }
        match self.detector.prune_history_older_than(cutoff) {
            Ok(removed) => report.pruned_transitions = removed,
            Err(e) => warn!(error = %e, "transition retention failed"),
        }
        report.expired_gate_entries = self.gate.cleanup_older_than(cutoff);

        match self.store.validate() {
            Ok(validation) => {
                for entry in &validation {
                    info!(
                        instrument = %entry.instrument,
                        records = entry.records,
                        invalid = entry.invalid,
                        "store validation"
                    );
                }
                report.invalid_records = validation.iter().map(|v| v.invalid).sum();
            }
            Err(e) => warn!(error = %e, "store validation failed"),
        }
        report
    }
}

fn admissible(obs: &Observation) -> std::result::Result<(), String> {
    obs.check_consistency()?;
    obs.key().map(|_| ()).map_err(|e| e.to_string())
}

fn matching_transition<'a>(
    transitions: &'a [TransitionEvent],
    obs: &Observation,
) -> Option<&'a TransitionEvent> {
    let key = obs.key().ok()?;
    transitions
        .iter()
        .rev()
        .find(|e| e.instrument == key && e.change_time == obs.timestamp && e.to_signal == obs.signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::Signal;
    use crate::detection::types::Importance;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, Signal, Option<Importance>)>>,
        failing: AtomicBool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, observation: &Observation, transition: Option<&TransitionEvent>) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("smtp unavailable"));
            }
            self.sent.lock().push((
                observation.instrument.clone(),
                observation.signal,
                transition.map(|t| t.importance),
            ));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        cycle: RefreshCycle,
        notifier: Arc<RecordingNotifier>,
        gate: Arc<NotificationGate>,
    }

    fn fixture(threshold: f64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObservationStore::new(dir.path().join("observations")));
        let detector = Arc::new(TransitionDetector::new(dir.path().join("changes")));
        let gate = Arc::new(NotificationGate::new(dir.path().join("changes")));
        let notifier = Arc::new(RecordingNotifier::default());
        let cycle = RefreshCycle::new(
            store,
            detector,
            Arc::clone(&gate),
            notifier.clone(),
            ThresholdPct::new(threshold).unwrap(),
        )
        .with_echo_dir(Some(dir.path().join("terminal")));
        Fixture {
            dir,
            cycle,
            notifier,
            gate,
        }
    }

    fn obs(instrument: &str, minute: i64, buy: f64, signal: Signal) -> Observation {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minute);
        Observation::new(instrument, t, buy, 100.0 - buy, signal)
    }

    #[test]
    fn test_first_cycle_notifies_everything() {
        let f = fixture(3.0);
        let report = f.cycle.run(&[obs("EURUSD", 0, 60.0, Signal::Buy), obs("GBPUSD", 0, 30.0, Signal::Sell)]);

        assert_eq!(report.stored, 2);
        assert_eq!(report.transitions, 0);
        assert_eq!(report.notified, 2);
        assert_eq!(f.gate.last_sent("GBPUSD").unwrap().signal, Signal::Sell);
        assert!(f.dir.path().join("terminal").join("snapshot.dat").exists());
    }

    #[test]
    fn test_gate_suppresses_small_reversal() {
        let f = fixture(3.0);
        f.cycle.run(&[obs("EURUSD", 0, 55.0, Signal::Buy)]);

        let report = f.cycle.run(&[obs("EURUSD", 5, 54.0, Signal::Sell)]);
        assert_eq!(report.transitions, 1);
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.notified, 0);

        let report = f.cycle.run(&[obs("EURUSD", 10, 58.0, Signal::Buy), obs("EURUSD", 15, 40.0, Signal::Sell)]);
        assert_eq!(report.transitions, 2);
        assert_eq!(report.notified, 1);

        let sent = f.notifier.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], ("EURUSD".to_string(), Signal::Sell, Some(Importance::Critical)));
    }

    #[test]
    fn test_failed_delivery_is_not_recorded() {
        let f = fixture(3.0);
        f.notifier.failing.store(true, Ordering::SeqCst);

        let report = f.cycle.run(&[obs("EURUSD", 0, 60.0, Signal::Buy)]);
        assert_eq!(report.notify_failures, 1);
        assert!(f.gate.last_sent("EURUSD").is_none());

        f.notifier.failing.store(false, Ordering::SeqCst);
        let report = f.cycle.run(&[obs("EURUSD", 5, 61.0, Signal::Buy)]);
        assert_eq!(report.notified, 1);
    }

    #[test]
    fn test_redelivered_batch_is_idempotent() {
        let f = fixture(3.0);
        let batch = [obs("EURUSD", 0, 60.0, Signal::Buy)];
        f.cycle.run(&batch);

        let report = f.cycle.run(&batch);
        assert_eq!(report.stored, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.transitions, 0);
        assert_eq!(report.notified, 0);
    }

    #[test]
    fn test_rejected_observation_skips_detection_and_gate() {
        let f = fixture(3.0);
        f.cycle.run(&[obs("EURUSD", 0, 60.0, Signal::Buy)]);

        let bad = Observation::new("EURUSD", obs("EURUSD", 5, 0.0, Signal::Sell).timestamp, -5.0, 40.0, Signal::Sell);
        let report = f.cycle.run(&[bad, obs("###", 5, 50.0, Signal::Neutral)]);

        assert_eq!(report.observations, 2);
        assert_eq!(report.store_failures, 2);
        assert_eq!(report.transitions, 0);
        assert_eq!(report.notified, 0);
        assert_eq!(report.suppressed, 0);
        assert_eq!(f.gate.last_sent("EURUSD").unwrap().signal, Signal::Buy);
        assert!(f.gate.last_sent("###").is_none());
        assert_eq!(f.notifier.sent.lock().len(), 1);
    }

    #[test]
    fn test_maintenance_applies_retention() {
        let f = fixture(3.0);
        let old = Utc::now() - Duration::days(60);
        let stale = |minute: i64, signal| {
            Observation::new("EURUSD", old + Duration::minutes(minute), 50.0, 50.0, signal)
        };
        f.cycle.run(&[stale(0, Signal::Buy), stale(5, Signal::Sell)]);
        f.gate.record_sent_at("EURUSD", Signal::Sell, 50.0, old);

        let report = f.cycle.maintain(Duration::days(30));
        assert_eq!(report.pruned_observations, 2);
        assert_eq!(report.pruned_transitions, 1);
        assert_eq!(report.expired_gate_entries, 1);
        assert_eq!(report.invalid_records, 0);
    }
}
