//! Poll loop timing under paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pulse_core::{LearnerConfig, LearningController, ManualClock, NominalHeadways};
use pulse_feed::fakes::ScriptedFeedClient;
use pulse_feed::RawDisruption;
use pulse_state::fakes::MemoryTransitStore;

fn central() -> RawDisruption {
    RawDisruption {
        line_id: Some("central".into()),
        mode: Some("tube".into()),
        category: Some("RealTime".into()),
        disruption_type: Some("lineInfo".into()),
        description: Some("Central line: minor delays".into()),
        severity_level: Some(9),
        created: Some(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()),
        ..Default::default()
    }
}

async fn controller(feed: Arc<ScriptedFeedClient>, timeout_secs: u64) -> Arc<LearningController> {
    let config = LearnerConfig {
        modes: vec!["tube".into()],
        learning_enabled: false,
        cycle_timeout_secs: timeout_secs,
        ..Default::default()
    };
    let headways = Arc::new(NominalHeadways::from_config(&config));
    let controller = LearningController::new(
        config,
        feed,
        Arc::new(MemoryTransitStore::new()),
        headways,
        Arc::new(ManualClock::new(Utc::now())),
    )
    .unwrap();
    controller.initialize().await.unwrap();
    Arc::new(controller)
}

#[tokio::test(start_paused = true)]
async fn first_cycle_runs_immediately_then_on_interval() {
    let feed = Arc::new(ScriptedFeedClient::new());
    feed.push_snapshot(vec![central()]);
    let handle = controller(feed.clone(), 60)
        .await
        .start(Duration::from_secs(120));

    let mut results = handle.subscribe();
    results.changed().await.unwrap();
    let first = results.borrow_and_update().clone().unwrap();
    assert_eq!(first.cycle_index, 1);
    assert_eq!(first.created, 1);

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(feed.disruption_fetches(), 1);

    results.changed().await.unwrap();
    let second = results.borrow_and_update().clone().unwrap();
    assert_eq!(second.cycle_index, 2);
    assert_eq!(second.unchanged, 1);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn slow_cycles_delay_the_next_tick_instead_of_overlapping() {
    let feed = Arc::new(ScriptedFeedClient::new());
    feed.push_snapshot(vec![central()]);
    feed.set_latency(Duration::from_secs(150));
    let handle = controller(feed.clone(), 300)
        .await
        .start(Duration::from_secs(120));

    let mut results = handle.subscribe();
    for expected in 1..=3 {
        results.changed().await.unwrap();
        let result = results.borrow_and_update().clone().unwrap();
        assert_eq!(result.cycle_index, expected);
        assert!(!result.timed_out);
    }
    assert_eq!(feed.disruption_fetches(), 3);
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_loop() {
    let feed = Arc::new(ScriptedFeedClient::new());
    feed.push_snapshot(vec![central()]);
    let controller = controller(feed.clone(), 60).await;
    let handle = controller.clone().start(Duration::from_secs(30));

    let mut results = handle.subscribe();
    results.changed().await.unwrap();
    assert!(handle.latest().is_some());
    handle.stop().await;

    let fetches = feed.disruption_fetches();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(feed.disruption_fetches(), fetches);
    assert_eq!(controller.cycle_index(), fetches);
}
