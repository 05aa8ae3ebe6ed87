pub mod gate;
pub mod notifier;
pub mod types;
