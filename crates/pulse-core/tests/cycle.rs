//! End-to-end poll cycles against the in-memory store and scripted feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pulse_core::{LearnerConfig, LearningController, ManualClock, NominalHeadways};
use pulse_feed::fakes::ScriptedFeedClient;
use pulse_feed::{AffectedStop, ArrivalPrediction, RawDisruption, SeverityCode};
use pulse_state::fakes::MemoryTransitStore;
use pulse_state::{DisruptionStore, LifecycleState, SeverityKey};

const OXFORD_CIRCUS: &str = "940GZZLUOXC";
const BANK: &str = "940GZZLUBNK";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, minute, 0).unwrap()
}

fn config() -> LearnerConfig {
    LearnerConfig {
        modes: vec!["tube".into()],
        learning_enabled: false,
        ..Default::default()
    }
}

fn learning_config() -> LearnerConfig {
    LearnerConfig {
        modes: vec!["tube".into()],
        sample_every_n: 1,
        min_samples_for_update: 3,
        ..Default::default()
    }
}

fn disruption(line: &str, updated_minute: u32) -> RawDisruption {
    RawDisruption {
        line_id: Some(line.to_string()),
        mode: Some("tube".into()),
        category: Some("RealTime".into()),
        disruption_type: Some("lineInfo".into()),
        description: Some(format!("{line} line: severe delays due to a signal failure")),
        severity_label: Some("Severe Delays".into()),
        severity_level: Some(6),
        created: Some(at(0)),
        last_update: Some(at(updated_minute)),
        ..Default::default()
    }
}

fn at_stops(mut raw: RawDisruption, stops: &[&str]) -> RawDisruption {
    raw.affected_stops = stops
        .iter()
        .map(|id| AffectedStop {
            stop_id: id.to_string(),
            name: None,
            lines: vec![],
        })
        .collect();
    raw
}

fn arrival(line: &str, stop: &str, minutes_after: i64) -> ArrivalPrediction {
    ArrivalPrediction {
        line_id: line.to_string(),
        stop_id: stop.to_string(),
        expected_arrival: t0() + chrono::Duration::minutes(minutes_after),
        vehicle_id: None,
        platform_name: None,
        direction: None,
    }
}

struct Harness {
    feed: Arc<ScriptedFeedClient>,
    store: Arc<MemoryTransitStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self {
            feed: Arc::new(ScriptedFeedClient::new()),
            store: Arc::new(MemoryTransitStore::new()),
            clock: Arc::new(ManualClock::new(t0())),
        }
    }

    async fn controller(&self, config: LearnerConfig) -> LearningController {
        let headways = Arc::new(NominalHeadways::from_config(&config));
        let controller = LearningController::new(
            config,
            self.feed.clone(),
            self.store.clone(),
            headways,
            self.clock.clone(),
        )
        .unwrap();
        controller.initialize().await.unwrap();
        controller
    }
}

#[tokio::test]
async fn first_cycle_creates_and_persists_records() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed
        .push_snapshot(vec![disruption("central", 1), disruption("victoria", 1)]);

    let result = controller.run_cycle().await;
    assert_eq!(result.cycle_index, 1);
    assert_eq!(result.created, 2);
    assert_eq!(result.errors.total(), 0);
    assert!(!result.feed_unavailable);

    let stored = h.store.list_active().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|r| r.state == LifecycleState::New));
    assert!(stored.iter().all(|r| r.first_seen == t0()));
}

#[tokio::test]
async fn repeated_snapshot_writes_nothing() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed.push_snapshot(vec![disruption("central", 1)]);

    controller.run_cycle().await;
    let writes = h.store.disruption_writes();

    h.clock.advance(chrono::Duration::minutes(2));
    let result = controller.run_cycle().await;
    assert_eq!(result.cycle_index, 2);
    assert_eq!(result.unchanged, 1);
    assert_eq!(result.created + result.updated + result.resolved, 0);
    assert_eq!(h.store.disruption_writes(), writes);
}

#[tokio::test]
async fn changed_last_update_is_an_update() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed.push_snapshot(vec![disruption("central", 1)]);
    h.feed.push_snapshot(vec![disruption("central", 7)]);

    controller.run_cycle().await;
    h.clock.set(at(8));
    let result = controller.run_cycle().await;
    assert_eq!(result.updated, 1);

    let stored = h.store.list_active().await.unwrap();
    assert_eq!(stored[0].state, LifecycleState::Updated);
    assert_eq!(stored[0].last_update, Some(at(7)));
    assert_eq!(stored[0].first_seen, t0());
    assert_eq!(stored[0].last_seen, at(8));
}

#[tokio::test]
async fn missing_records_resolve_and_stay_resolved() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed
        .push_snapshot(vec![disruption("central", 1), disruption("victoria", 1)]);
    h.feed.push_snapshot(vec![disruption("central", 1)]);
    h.feed
        .push_snapshot(vec![disruption("central", 1), disruption("victoria", 1)]);

    controller.run_cycle().await;
    h.clock.set(at(4));
    let result = controller.run_cycle().await;
    assert_eq!(result.resolved, 1);

    let resolved = h.store.list_resolved_since(t0()).await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].line_id, "victoria");
    assert_eq!(resolved[0].resolved_at, Some(at(4)));

    let result = controller.run_cycle().await;
    assert_eq!(result.created, 0);
    assert_eq!(result.suppressed, 1);
    assert_eq!(controller.active_disruptions().await.len(), 1);
}

#[tokio::test]
async fn feed_outage_skips_reconciliation() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed.push_snapshot(vec![disruption("central", 1)]);
    controller.run_cycle().await;

    h.feed.fail_next_fetches(1);
    let result = controller.run_cycle().await;
    assert!(result.feed_unavailable);
    assert_eq!(result.errors.feed, 1);
    assert_eq!(result.resolved, 0);
    assert_eq!(h.store.list_active().await.unwrap().len(), 1);

    let result = controller.run_cycle().await;
    assert!(!result.feed_unavailable);
    assert_eq!(result.unchanged, 1);
}

#[tokio::test]
async fn malformed_items_are_counted_and_skipped() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    let mut no_line = disruption("central", 1);
    no_line.line_id = None;
    let mut blank = disruption("victoria", 1);
    blank.description = Some("   ".into());
    h.feed
        .push_snapshot(vec![no_line, blank, disruption("jubilee", 1)]);

    let result = controller.run_cycle().await;
    assert_eq!(result.errors.malformed, 2);
    assert_eq!(result.created, 1);
}

#[tokio::test]
async fn failed_write_is_rolled_back_and_retried_next_cycle() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed.push_snapshot(vec![disruption("central", 1)]);

    h.store.fail_next_disruption_writes(2);
    let result = controller.run_cycle().await;
    assert_eq!(result.created, 0);
    assert_eq!(result.errors.persistence, 1);
    assert!(controller.active_disruptions().await.is_empty());
    assert!(h.store.list_active().await.unwrap().is_empty());

    let result = controller.run_cycle().await;
    assert_eq!(result.created, 1);
    assert_eq!(result.errors.total(), 0);
}

#[tokio::test]
async fn single_write_failure_is_absorbed_by_retry() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed.push_snapshot(vec![disruption("central", 1)]);

    h.store.fail_next_disruption_writes(1);
    let result = controller.run_cycle().await;
    assert_eq!(result.created, 1);
    assert_eq!(result.errors.persistence, 0);
}

#[tokio::test]
async fn restart_resumes_from_storage() {
    let h = Harness::new();
    {
        let controller = h.controller(config()).await;
        h.feed
            .push_snapshot(vec![disruption("central", 1), disruption("victoria", 1)]);
        h.feed.push_snapshot(vec![disruption("central", 1)]);
        controller.run_cycle().await;
        controller.run_cycle().await;
    }

    h.feed
        .push_snapshot(vec![disruption("central", 1), disruption("victoria", 1)]);
    let controller = h.controller(config()).await;
    let active = controller.active_disruptions().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].state, LifecycleState::Active);

    let result = controller.run_cycle().await;
    assert_eq!(result.cycle_index, 1);
    assert_eq!(result.created, 0);
    assert_eq!(result.unchanged, 1);
    assert_eq!(result.suppressed, 1);
}

#[tokio::test]
async fn initialize_seeds_once() {
    let h = Harness::new();
    let first = LearningController::new(
        config(),
        h.feed.clone(),
        h.store.clone(),
        Arc::new(NominalHeadways::from_config(&config())),
        h.clock.clone(),
    )
    .unwrap();
    let report = first.initialize().await.unwrap();
    assert_eq!(report.estimates_seeded, 21);
    assert_eq!(report.estimates_loaded, 21);

    let report = first.initialize().await.unwrap();
    assert_eq!(report.estimates_seeded, 0);
    assert_eq!(report.estimates_loaded, 21);
}

#[tokio::test]
async fn seeding_from_feed_adds_unknown_codes_only() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed.set_severity_codes(vec![
        SeverityCode {
            mode: "tube".into(),
            level: 6,
            description: "Severe Delays".into(),
        },
        SeverityCode {
            mode: "tram".into(),
            level: 9,
            description: "Minor Delays".into(),
        },
    ]);

    assert_eq!(controller.seed_from_feed().await.unwrap(), 1);
    let tram = controller
        .model()
        .get(&SeverityKey::new("tram", 9))
        .await
        .unwrap();
    assert_eq!(tram.estimated_delay_minutes, 5.0);
}

#[tokio::test]
async fn sampling_cycle_learns_from_headways() {
    let h = Harness::new();
    h.store.add_stop(
        OXFORD_CIRCUS,
        Some("Oxford Circus"),
        &["central", "victoria", "bakerloo"],
    );
    h.store
        .add_stop(BANK, Some("Bank"), &["central", "northern", "waterloo-city"]);
    h.feed.push_snapshot(vec![at_stops(
        disruption("central", 1),
        &[OXFORD_CIRCUS, BANK],
    )]);
    // Trains every 5 minutes against a 3 minute nominal headway.
    h.feed.set_arrivals(
        OXFORD_CIRCUS,
        vec![
            arrival("central", OXFORD_CIRCUS, 10),
            arrival("central", OXFORD_CIRCUS, 0),
            arrival("central", OXFORD_CIRCUS, 5),
            arrival("central", OXFORD_CIRCUS, 15),
        ],
    );
    h.feed.fail_stop(BANK);

    let controller = h.controller(learning_config()).await;
    let result = controller.run_cycle().await;

    assert_eq!(result.created, 1);
    assert_eq!(result.samples_taken, 3);
    assert_eq!(result.errors.sampling, 1);
    assert_eq!(result.estimates_updated, 1);

    let samples = h.store.all_samples();
    assert_eq!(samples.len(), 3);
    assert!(samples
        .iter()
        .all(|s| (s.excess_delay_minutes - 2.0).abs() < 1e-9));

    // Prior weight 0.3 * 20 = 6 at 12 minutes, batch of 3 at 2 minutes.
    let estimate = controller
        .model()
        .get(&SeverityKey::new("tube", 6))
        .await
        .unwrap();
    assert!((estimate.estimated_delay_minutes - 78.0 / 9.0).abs() < 1e-9);
    assert!((estimate.confidence_score - 0.37).abs() < 1e-9);
    assert_eq!(estimate.sample_count, 3);
}

#[tokio::test]
async fn sampling_waits_for_its_cadence() {
    let h = Harness::new();
    h.store
        .add_stop(OXFORD_CIRCUS, None, &["central", "victoria", "bakerloo"]);
    h.feed.push_snapshot(vec![at_stops(
        disruption("central", 1),
        &[OXFORD_CIRCUS],
    )]);
    h.feed.set_arrivals(
        OXFORD_CIRCUS,
        vec![
            arrival("central", OXFORD_CIRCUS, 0),
            arrival("central", OXFORD_CIRCUS, 4),
        ],
    );

    let config = LearnerConfig {
        sample_every_n: 3,
        ..learning_config()
    };
    let controller = h.controller(config).await;
    for _ in 0..2 {
        assert_eq!(controller.run_cycle().await.samples_taken, 0);
    }
    assert_eq!(h.feed.arrival_fetches(), 0);

    let result = controller.run_cycle().await;
    assert_eq!(result.cycle_index, 3);
    assert_eq!(result.samples_taken, 1);
    assert_eq!(result.estimates_updated, 0);
    assert_eq!(
        controller
            .model()
            .pending_len(&SeverityKey::new("tube", 6))
            .await,
        1
    );
}

#[tokio::test]
async fn disabled_learning_never_samples() {
    let h = Harness::new();
    h.store
        .add_stop(OXFORD_CIRCUS, None, &["central", "victoria", "bakerloo"]);
    h.feed.push_snapshot(vec![at_stops(
        disruption("central", 1),
        &[OXFORD_CIRCUS],
    )]);

    let config = LearnerConfig {
        learning_enabled: false,
        ..learning_config()
    };
    let controller = h.controller(config).await;
    controller.run_cycle().await;
    controller.run_cycle().await;
    assert_eq!(h.feed.arrival_fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_feed_times_out_the_cycle() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed.push_snapshot(vec![disruption("central", 1)]);
    h.feed.set_latency(Duration::from_secs(90));

    let result = controller.run_cycle().await;
    assert!(result.timed_out);
    assert!(result.feed_unavailable);
    assert_eq!(result.created, 0);
    assert!(h.store.list_active().await.unwrap().is_empty());

    h.feed.set_latency(Duration::ZERO);
    let result = controller.run_cycle().await;
    assert!(!result.timed_out);
    assert_eq!(result.created, 1);
}

/// Central line disrupted at Oxford Circus, trains every 5 minutes against a
/// 3 minute nominal headway: three samples of 2 minutes per cycle.
fn central_at_oxford_circus(h: &Harness) {
    h.store.add_stop(
        OXFORD_CIRCUS,
        Some("Oxford Circus"),
        &["central", "victoria", "bakerloo"],
    );
    h.feed.push_snapshot(vec![at_stops(
        disruption("central", 1),
        &[OXFORD_CIRCUS],
    )]);
    h.feed.set_arrivals(
        OXFORD_CIRCUS,
        (0..4)
            .map(|i| arrival("central", OXFORD_CIRCUS, i * 5))
            .collect(),
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_merge_keeps_buffered_samples() {
    let h = Harness::new();
    central_at_oxford_circus(&h);
    let config = LearnerConfig {
        cycle_timeout_secs: 60,
        ..learning_config()
    };
    let controller = h.controller(config).await;
    let key = SeverityKey::new("tube", 6);

    h.store.delay_next_estimate_write(Duration::from_secs(120));
    let result = controller.run_cycle().await;
    assert!(result.timed_out);
    assert_eq!(result.samples_taken, 3);
    assert_eq!(h.store.all_samples().len(), 3);
    assert_eq!(controller.model().pending_len(&key).await, 3);
    assert_eq!(controller.model().get(&key).await.unwrap().sample_count, 0);

    let result = controller.run_cycle().await;
    assert!(!result.timed_out);
    assert_eq!(result.estimates_updated, 1);
    assert_eq!(h.store.all_samples().len(), 6);
    assert_eq!(controller.model().pending_len(&key).await, 0);

    // Prior weight 6 at 12 minutes, batch of 6 at 2 minutes.
    let estimate = controller.model().get(&key).await.unwrap();
    assert_eq!(estimate.sample_count, 6);
    assert!((estimate.estimated_delay_minutes - 7.0).abs() < 1e-9);
}

#[tokio::test]
async fn unstored_samples_leave_the_buffer() {
    let h = Harness::new();
    central_at_oxford_circus(&h);
    let controller = h.controller(learning_config()).await;

    h.store.fail_next_sample_writes(2);
    let result = controller.run_cycle().await;
    assert_eq!(result.samples_taken, 2);
    assert_eq!(result.errors.persistence, 1);
    assert_eq!(h.store.all_samples().len(), 2);
    assert_eq!(
        controller
            .model()
            .pending_len(&SeverityKey::new("tube", 6))
            .await,
        2
    );
}

#[tokio::test]
async fn resolved_identity_stays_suppressed_past_retention() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    h.feed
        .push_snapshot(vec![disruption("central", 1), disruption("victoria", 1)]);
    h.feed.push_snapshot(vec![disruption("central", 1)]);
    h.feed
        .push_snapshot(vec![disruption("central", 1), disruption("victoria", 1)]);

    controller.run_cycle().await;
    h.clock.set(at(4));
    assert_eq!(controller.run_cycle().await.resolved, 1);

    for days in [1, 8, 15] {
        h.clock.set(at(4) + chrono::Duration::days(days));
        let result = controller.run_cycle().await;
        assert_eq!(result.created, 0);
        assert_eq!(result.suppressed, 1);
        assert_eq!(result.errors.total(), 0);
    }

    let resolved = h.store.list_resolved_since(t0()).await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].resolved_at, Some(at(4)));
    assert_eq!(controller.active_disruptions().await.len(), 1);
}

#[tokio::test]
async fn partial_update_without_section_is_reported_degraded() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    let mut part_suspended = disruption("central", 6);
    part_suspended.description = Some("Central line: part suspended".into());
    h.feed.push_snapshot(vec![disruption("central", 1)]);
    h.feed.push_snapshot(vec![part_suspended]);

    let result = controller.run_cycle().await;
    assert_eq!(result.created, 1);
    assert_eq!(result.degraded, 0);

    h.clock.set(at(7));
    let result = controller.run_cycle().await;
    assert_eq!(result.updated, 1);
    assert_eq!(result.degraded, 1);

    let stored = h.store.list_active().await.unwrap();
    assert_eq!(stored[0].suspension, pulse_state::SuspensionKind::Partial);
    assert!(stored[0].section.is_none());
}

#[tokio::test]
async fn repeated_text_identity_is_counted_as_ambiguous() {
    let h = Harness::new();
    let controller = h.controller(config()).await;
    let mut first = disruption("central", 1);
    first.created = None;
    let mut second = first.clone();
    second.last_update = Some(at(2));
    h.feed.push_snapshot(vec![first, second]);

    let result = controller.run_cycle().await;
    assert_eq!(result.created, 1);
    assert_eq!(result.errors.identity_ambiguity, 1);
    assert_eq!(h.store.list_active().await.unwrap()[0].last_update, Some(at(2)));
}

#[test]
fn invalid_config_is_rejected() {
    let h = Harness::new();
    let config = LearnerConfig {
        sample_every_n: 0,
        ..config()
    };
    let result = LearningController::new(
        config.clone(),
        h.feed.clone(),
        h.store.clone(),
        Arc::new(NominalHeadways::from_config(&config)),
        h.clock.clone(),
    );
    assert!(result.is_err());
}
