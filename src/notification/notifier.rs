use anyhow::Result;
use tracing::info;

use crate::data::types::Observation;
use crate::detection::types::TransitionEvent;

/// Delivery transport for approved notifications (mail, chat, ...).
///
/// Returning `Ok` means delivery was confirmed; only then is the sent state
/// recorded in the gate.
pub trait Notifier: Send + Sync {
    fn notify(&self, observation: &Observation, transition: Option<&TransitionEvent>) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Emits the notification as a structured log event.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, observation: &Observation, transition: Option<&TransitionEvent>) -> Result<()> {
        let (buy, sell) = observation.normalized_pcts();
        match transition {
            Some(event) => info!(
                instrument = %event.instrument,
                from = %event.from_signal,
                to = %event.to_signal,
                importance = %event.importance,
                buy_pct = %format!("{buy:.1}"),
                sell_pct = %format!("{sell:.1}"),
                "📣 signal change notification"
            ),
            None => info!(
                instrument = %observation.instrument,
                signal = %observation.signal,
                buy_pct = %format!("{buy:.1}"),
                sell_pct = %format!("{sell:.1}"),
                "📣 signal notification"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
