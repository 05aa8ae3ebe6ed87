//! Sentiment signal watcher: per-instrument observation storage, signal
//! transition detection and anti-spam notification gating.

pub mod config;
pub mod data;
pub mod detection;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod notification;

pub use data::store::ObservationStore;
pub use data::types::{Observation, Signal};
pub use detection::detector::TransitionDetector;
pub use detection::types::{Actuality, Importance, TransitionEvent};
pub use error::{Result, WatchError};
pub use notification::gate::NotificationGate;
pub use notification::types::{LastSentSignal, ThresholdPct};
