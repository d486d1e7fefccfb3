//! Transit Pulse daemon
//!
//! Runs the learning controller on its poll interval until SIGINT/SIGTERM.
//!
//! Environment: `PULSE_CONFIG` (optional TOML path), `PULSE_LOG_JSON`,
//! the `SURREALDB_*` connection variables and the `TFL_*` feed variables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use pulse_core::{LearnerConfig, LearningController, NominalHeadways, SystemClock};
use pulse_feed::{FeedClient, TflClient};
use pulse_state::SurrealTransitStore;
use tracing::{info, Level};

fn json_logs(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1" | "true" | "yes"))
}

async fn start_controller(
    config: LearnerConfig,
    feed: Arc<dyn FeedClient>,
    store: Arc<SurrealTransitStore>,
) -> Result<Arc<LearningController>> {
    let headways = Arc::new(NominalHeadways::from_config(&config));
    let controller =
        LearningController::new(config, feed, store, headways, Arc::new(SystemClock))?;
    let report = controller
        .initialize()
        .await
        .context("Failed to restore learner state")?;
    info!(
        active = report.active_disruptions,
        tombstones = report.tombstones,
        estimates = report.estimates_loaded,
        pending_samples = report.pending_samples_restored,
        major_stops = report.major_stops,
        "pulsed initialised"
    );
    Ok(Arc::new(controller))
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for Ctrl-C")?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    pulse_core::telemetry::init_tracing(json_logs(std::env::var("PULSE_LOG_JSON").ok()), Level::INFO);

    let config_path = std::env::var("PULSE_CONFIG").ok().map(PathBuf::from);
    let config =
        LearnerConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let interval = config.poll_interval();

    let store = Arc::new(
        SurrealTransitStore::from_env()
            .await
            .context("Failed to connect to the Transit Pulse database")?,
    );
    let feed: Arc<dyn FeedClient> =
        Arc::new(TflClient::from_env().context("Feed client unavailable")?);

    let controller = start_controller(config, feed, store).await?;
    let handle = controller.start(interval);
    info!(interval_secs = interval.as_secs(), "pulsed started");

    shutdown_signal().await?;
    info!("shutdown requested; finishing in-flight cycle");
    handle.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_feed::fakes::ScriptedFeedClient;

    #[test]
    fn json_logging_flag() {
        assert!(json_logs(Some("1".into())));
        assert!(json_logs(Some("true".into())));
        assert!(!json_logs(Some("0".into())));
        assert!(!json_logs(None));
    }

    #[tokio::test]
    async fn controller_starts_against_an_empty_database() {
        let store = Arc::new(SurrealTransitStore::in_memory().await.unwrap());
        let config = LearnerConfig {
            modes: vec!["dlr".into()],
            ..Default::default()
        };
        let feed = Arc::new(ScriptedFeedClient::new());
        let controller = start_controller(config, feed, store).await.unwrap();

        let result = controller.run_cycle().await;
        assert_eq!(result.cycle_index, 1);
        assert_eq!(result.created, 0);
        assert!(!result.feed_unavailable);
    }
}
