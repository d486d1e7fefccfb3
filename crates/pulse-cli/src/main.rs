//! Transit Pulse CLI
//!
//! The `pulse` command drives the disruption learner by hand.
//!
//! ## Commands
//!
//! - `run-once`: Run a single poll cycle and print its summary
//! - `watch`: Poll continuously until interrupted
//! - `seed`: Seed severity estimates (reference table, optionally the feed)
//! - `estimates`: List learned severity estimates
//! - `active`: List tracked active disruptions
//! - `classify`: Classify a piece of disruption text
//! - `import-stops`: Load stop/line topology from the feed

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_core::{
    Analyzer, CycleResult, LearnerConfig, LearningController, NominalHeadways, SystemClock,
};
use pulse_feed::{FeedClient, StopPointLines, TflClient};
use pulse_state::{
    DisruptionStore, SeverityLevelEstimate, SeverityStore, SurrealTransitStore, TopologyStore,
};
use serde_json::json;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "pulse")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transit disruption tracker and severity-to-delay learner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Learner configuration file (TOML)
    #[arg(short, long, global = true, env = "PULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Use a throwaway in-memory database
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single poll cycle
    RunOnce,

    /// Poll continuously until Ctrl-C
    Watch {
        /// Poll interval in seconds (default: from configuration)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Seed severity estimates that are not stored yet
    Seed {
        /// Also seed from the severity codes the feed publishes
        #[arg(long)]
        from_feed: bool,
    },

    /// List severity estimates
    Estimates,

    /// List active disruptions
    Active,

    /// Classify disruption text as none, partial or full suspension
    Classify {
        /// Description text
        text: String,

        /// Optional closure text
        #[arg(long)]
        closure: Option<String>,
    },

    /// Import stop/line topology for the configured modes
    ImportStops,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    pulse_core::telemetry::init_tracing(cli.json, level);

    let config = LearnerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Commands::Classify { text, closure } = &cli.command {
        return cmd_classify(&config, text, closure.as_deref(), cli.json);
    }

    let store = Arc::new(open_store(cli.memory).await?);

    match cli.command {
        Commands::RunOnce => {
            let result = cmd_run_once(config, live_feed()?, store).await?;
            print_cycle(&result, cli.json)
        }
        Commands::Watch { interval } => cmd_watch(config, live_feed()?, store, interval).await,
        Commands::Seed { from_feed } => {
            let feed = live_feed_or_none(from_feed)?;
            let (reference, published) = cmd_seed(config, feed, store).await?;
            println!("Seeded {reference} reference and {published} published estimates");
            Ok(())
        }
        Commands::Estimates => cmd_estimates(store.as_ref(), cli.json).await,
        Commands::Active => cmd_active(store.as_ref(), cli.json).await,
        Commands::ImportStops => {
            let client = TflClient::from_env().context("Feed client unavailable")?;
            let stops = client
                .fetch_stop_points(&config.modes)
                .await
                .context("Failed to fetch stop points")?;
            let imported = import_stop_lines(store.as_ref(), &stops).await?;
            let major = store
                .major_stops(config.major_stop_threshold, config.max_major_stops)
                .await?;
            println!(
                "Imported {} stop/line pairs for {} stops; {} major stops",
                imported,
                stops.len(),
                major.len()
            );
            Ok(())
        }
        Commands::Classify { .. } => Ok(()),
    }
}

async fn open_store(memory: bool) -> Result<SurrealTransitStore> {
    let store = if memory {
        SurrealTransitStore::in_memory().await
    } else {
        SurrealTransitStore::from_env().await
    };
    store.context("Failed to connect to the Transit Pulse database")
}

fn live_feed() -> Result<Arc<dyn FeedClient>> {
    let client = TflClient::from_env().context("Feed client unavailable")?;
    Ok(Arc::new(client))
}

fn live_feed_or_none(wanted: bool) -> Result<Option<Arc<dyn FeedClient>>> {
    if wanted {
        live_feed().map(Some)
    } else {
        Ok(None)
    }
}

async fn build_controller(
    config: LearnerConfig,
    feed: Arc<dyn FeedClient>,
    store: Arc<SurrealTransitStore>,
) -> Result<LearningController> {
    let headways = Arc::new(NominalHeadways::from_config(&config));
    let controller =
        LearningController::new(config, feed, store, headways, Arc::new(SystemClock))?;
    let report = controller
        .initialize()
        .await
        .context("Failed to restore learner state")?;
    info!(
        active = report.active_disruptions,
        estimates = report.estimates_loaded,
        "learner ready"
    );
    Ok(controller)
}

async fn cmd_run_once(
    config: LearnerConfig,
    feed: Arc<dyn FeedClient>,
    store: Arc<SurrealTransitStore>,
) -> Result<CycleResult> {
    let controller = build_controller(config, feed, store).await?;
    Ok(controller.run_cycle().await)
}

async fn cmd_watch(
    config: LearnerConfig,
    feed: Arc<dyn FeedClient>,
    store: Arc<SurrealTransitStore>,
    interval: Option<u64>,
) -> Result<()> {
    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.poll_interval());
    let controller = Arc::new(build_controller(config, feed, store).await?);
    let handle = controller.start(interval);

    println!("Watching (every {}s); press Ctrl-C to stop", interval.as_secs());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    handle.stop().await;
    Ok(())
}

/// Returns (reference estimates seeded, feed-published estimates seeded).
async fn cmd_seed(
    config: LearnerConfig,
    feed: Option<Arc<dyn FeedClient>>,
    store: Arc<SurrealTransitStore>,
) -> Result<(usize, usize)> {
    let offline = feed.is_none();
    let feed = feed.unwrap_or_else(|| Arc::new(OfflineFeed) as Arc<dyn FeedClient>);
    let headways = Arc::new(NominalHeadways::from_config(&config));
    let controller =
        LearningController::new(config, feed, store, headways, Arc::new(SystemClock))?;

    let reference = controller.initialize().await?.estimates_seeded;
    let published = if offline {
        0
    } else {
        controller
            .seed_from_feed()
            .await
            .context("Failed to seed from feed severity codes")?
    };
    Ok((reference, published))
}

async fn cmd_estimates(store: &SurrealTransitStore, json: bool) -> Result<()> {
    let estimates = store.list_estimates().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&estimates)?);
        return Ok(());
    }
    if estimates.is_empty() {
        println!("No estimates stored. Run 'pulse seed' first.");
        return Ok(());
    }
    for estimate in &estimates {
        println!("{}", render_estimate(estimate));
    }
    Ok(())
}

async fn cmd_active(store: &SurrealTransitStore, json: bool) -> Result<()> {
    let records = store.list_active().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No active disruptions");
    }
    for record in &records {
        let section = record
            .section
            .as_ref()
            .map(|s| format!(" [{} -> {}]", s.start, s.end))
            .unwrap_or_default();
        println!(
            "{}  {:<16} {:<8} {}{}",
            record.id,
            record.line_id,
            record.suspension.as_str(),
            record.state.as_str(),
            section
        );
        println!("    {}", record.description);
    }
    Ok(())
}

fn cmd_classify(config: &LearnerConfig, text: &str, closure: Option<&str>, json: bool) -> Result<()> {
    let analyzer = Analyzer::new(&config.keywords)?;
    let classification = analyzer.classify(text, closure, &[]);
    if json {
        let value = json!({
            "suspension": classification.kind.as_str(),
            "section": classification.section,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", classification.kind.as_str());
    }
    Ok(())
}

/// Store every stop's serving lines; returns the number of pairs written.
async fn import_stop_lines(store: &SurrealTransitStore, stops: &[StopPointLines]) -> Result<usize> {
    let mut written = 0;
    for stop in stops {
        written += store
            .put_stop_lines(&stop.stop_id, stop.name.as_deref(), &stop.lines)
            .await
            .with_context(|| format!("Failed to store lines for {}", stop.stop_id))?;
    }
    Ok(written)
}

fn print_cycle(result: &CycleResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        println!("{}", render_cycle(result));
    }
    Ok(())
}

fn render_cycle(result: &CycleResult) -> String {
    if result.feed_unavailable {
        let why = if result.timed_out { "timed out" } else { "feed unavailable" };
        return format!("cycle {}: skipped ({why})", result.cycle_index);
    }
    format!(
        "cycle {}: {} created, {} updated, {} resolved, {} unchanged; {} samples, {} estimates updated, {} errors ({} ms)",
        result.cycle_index,
        result.created,
        result.updated,
        result.resolved,
        result.unchanged,
        result.samples_taken,
        result.estimates_updated,
        result.errors.total(),
        result.duration_ms,
    )
}

fn render_estimate(estimate: &SeverityLevelEstimate) -> String {
    let delay = if estimate.is_suspension {
        "suspended".to_string()
    } else {
        format!("{:.1} min", estimate.estimated_delay_minutes)
    };
    format!(
        "{:<24} {:<22} {:>10}  conf {:.2}  n={}",
        estimate.key.to_string(),
        estimate.description,
        delay,
        estimate.confidence_score,
        estimate.sample_count
    )
}

/// Feed stand-in for commands that must not reach the network.
struct OfflineFeed;

#[async_trait::async_trait]
impl FeedClient for OfflineFeed {
    async fn fetch_disruptions(
        &self,
        _modes: &[String],
    ) -> pulse_feed::FeedResult<Vec<pulse_feed::RawDisruption>> {
        Err(pulse_feed::FeedError::MissingCredentials(
            "offline: feed access disabled".into(),
        ))
    }

    async fn fetch_arrivals(
        &self,
        _line_ids: &[String],
        _stop_id: &str,
        _direction: Option<&str>,
    ) -> pulse_feed::FeedResult<Vec<pulse_feed::ArrivalPrediction>> {
        Err(pulse_feed::FeedError::MissingCredentials(
            "offline: feed access disabled".into(),
        ))
    }

    async fn fetch_severity_codes(&self) -> pulse_feed::FeedResult<Vec<pulse_feed::SeverityCode>> {
        Err(pulse_feed::FeedError::MissingCredentials(
            "offline: feed access disabled".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pulse_feed::fakes::ScriptedFeedClient;
    use pulse_feed::{RawDisruption, SeverityCode};
    use pulse_state::{SeverityKey, SuspensionKind};

    fn config() -> LearnerConfig {
        LearnerConfig {
            modes: vec!["tube".into()],
            learning_enabled: false,
            ..Default::default()
        }
    }

    fn central() -> RawDisruption {
        RawDisruption {
            line_id: Some("central".into()),
            mode: Some("tube".into()),
            category: Some("RealTime".into()),
            disruption_type: Some("lineInfo".into()),
            description: Some("Central line: no service between Liverpool Street and Epping".into()),
            severity_level: Some(3),
            created: Some(Utc.with_ymd_and_hms(2026, 3, 2, 7, 40, 0).unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_once_persists_to_the_database() {
        let store = Arc::new(SurrealTransitStore::in_memory().await.unwrap());
        let feed = Arc::new(ScriptedFeedClient::new());
        feed.push_snapshot(vec![central()]);

        let result = cmd_run_once(config(), feed, store.clone()).await.unwrap();
        assert_eq!(result.created, 1);

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].suspension, SuspensionKind::Partial);
        assert!(render_cycle(&result).starts_with("cycle 1: 1 created"));
    }

    #[tokio::test]
    async fn seed_is_offline_unless_asked() {
        let store = Arc::new(SurrealTransitStore::in_memory().await.unwrap());
        let (reference, published) = cmd_seed(config(), None, store.clone()).await.unwrap();
        assert_eq!(reference, 21);
        assert_eq!(published, 0);

        let feed = Arc::new(ScriptedFeedClient::new());
        feed.set_severity_codes(vec![SeverityCode {
            mode: "bus".into(),
            level: 9,
            description: "Minor Delays".into(),
        }]);
        let (reference, published) = cmd_seed(config(), Some(feed as Arc<dyn FeedClient>), store.clone()).await.unwrap();
        assert_eq!(reference, 0);
        assert_eq!(published, 1);
        assert!(store
            .get_estimate(&SeverityKey::new("bus", 9))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn imported_stops_feed_the_major_stop_query() {
        let store = SurrealTransitStore::in_memory().await.unwrap();
        let stops = vec![
            StopPointLines {
                stop_id: "940GZZLUOXC".into(),
                name: Some("Oxford Circus".into()),
                lines: vec!["bakerloo".into(), "central".into(), "victoria".into()],
            },
            StopPointLines {
                stop_id: "940GZZLUHPK".into(),
                name: Some("Holland Park".into()),
                lines: vec!["central".into()],
            },
        ];
        assert_eq!(import_stop_lines(&store, &stops).await.unwrap(), 4);

        let major = store.major_stops(3, 10).await.unwrap();
        assert_eq!(major.len(), 1);
        assert_eq!(major[0].stop_id, "940GZZLUOXC");
    }

    #[test]
    fn classify_reports_the_suspension_kind() {
        cmd_classify(&config(), "Part suspended between A and B", None, false).unwrap();
        cmd_classify(&config(), "No service", Some("line closed"), true).unwrap();
    }

    #[test]
    fn skipped_cycle_renders_reason() {
        let mut result = CycleResult {
            cycle_index: 4,
            started_at: Utc::now(),
            created: 0,
            updated: 0,
            resolved: 0,
            unchanged: 0,
            suppressed: 0,
            degraded: 0,
            samples_taken: 0,
            samples_discarded: 0,
            estimates_updated: 0,
            errors: Default::default(),
            feed_unavailable: true,
            timed_out: true,
            duration_ms: 60_000,
        };
        assert_eq!(render_cycle(&result), "cycle 4: skipped (timed out)");
        result.timed_out = false;
        assert_eq!(render_cycle(&result), "cycle 4: skipped (feed unavailable)");
    }

    #[test]
    fn suspension_estimates_render_without_delay() {
        let estimate = SeverityLevelEstimate {
            key: SeverityKey::new("tube", 20),
            description: "Service Closed".into(),
            estimated_delay_minutes: 0.0,
            confidence_score: 0.3,
            sample_count: 0,
            is_suspension: true,
            last_updated: Utc::now(),
        };
        assert!(render_estimate(&estimate).contains("suspended"));
    }
}
