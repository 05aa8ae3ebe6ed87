use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sentiment_watch::config::{Config, EnvConfig};
use sentiment_watch::data::source::{JsonFileSource, ObservationSource};
use sentiment_watch::execution::cycle::RefreshCycle;
use sentiment_watch::monitoring::logger::init_logger;
use sentiment_watch::notification::notifier::LogNotifier;
use sentiment_watch::{NotificationGate, ObservationStore, TransitionDetector};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_logger("sentiment-watch");

    info!("🚀 Sentiment watch starting...");

    // Load configuration
    let env_config = EnvConfig::load()?;
    let mut config = Config::load(&env_config.config_path)?;
    config.apply_env(&env_config);
    config.validate().context("Invalid configuration")?;
    let threshold = config.threshold()?;

    info!("Data directory: {}", config.storage.data_dir);
    info!("Notification threshold: {:.2}%", threshold.value());
    info!("Retention: {} days", config.storage.retention_days);
    info!("Refresh interval: {}s", config.cycle.interval_secs);

    // Restore persisted state
    let store = Arc::new(
        ObservationStore::new(config.observations_dir())
            .with_duplicate_window(config.storage.duplicate_window),
    );
    let detector = Arc::new(TransitionDetector::load_snapshot(config.changes_dir())?);
    let gate = Arc::new(NotificationGate::load(config.changes_dir())?);
    info!("Known instruments: {}", detector.known_instruments());

    let cycle = Arc::new(
        RefreshCycle::new(store, detector, gate, Arc::new(LogNotifier), threshold)
            .with_echo_dir(config.echo_dir()),
    );
    let source: Arc<dyn ObservationSource> =
        Arc::new(JsonFileSource::new(&config.cycle.source_path));
    let retention = config.retention();

    info!("✅ Initialized, watching {} ({})", config.cycle.source_path, source.name());

    let mut refresh = tokio::time::interval(Duration::from_secs(config.cycle.interval_secs));
    let mut maintenance =
        tokio::time::interval(Duration::from_secs(config.cycle.maintenance_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = refresh.tick() => {
                let cycle = Arc::clone(&cycle);
                let source = Arc::clone(&source);
                // core operations block on file I/O
                let outcome = tokio::task::spawn_blocking(move || -> Result<_> {
                    let batch = source.fetch()?;
                    Ok(cycle.run(&batch))
                })
                .await;

                match outcome {
                    Ok(Ok(report)) => debug!(?report, "cycle report"),
                    Ok(Err(e)) => warn!("Observation source failed: {:#}", e),
                    Err(e) => error!("Refresh cycle aborted: {}", e),
                }
            }
            _ = maintenance.tick() => {
                let cycle = Arc::clone(&cycle);
                match tokio::task::spawn_blocking(move || cycle.maintain(retention)).await {
                    Ok(report) => info!(?report, "maintenance complete"),
                    Err(e) => error!("Maintenance aborted: {}", e),
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down...");
    Ok(())
}
