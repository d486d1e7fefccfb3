//! Scripted in-memory feed (testing only)
//!
//! `ScriptedFeedClient` replays queued disruption snapshots, serves fixed
//! arrival predictions per stop, and can inject failures or latency.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::FeedClient;
use crate::error::{FeedError, FeedResult};
use crate::types::{ArrivalPrediction, RawDisruption, SeverityCode};

/// Feed double driven by test scripts.
///
/// When the snapshot queue runs dry the last served snapshot is repeated,
/// matching a feed whose state has stopped changing.
#[derive(Debug, Default)]
pub struct ScriptedFeedClient {
    snapshots: Mutex<VecDeque<Vec<RawDisruption>>>,
    last_snapshot: Mutex<Vec<RawDisruption>>,
    arrivals: Mutex<HashMap<String, Vec<ArrivalPrediction>>>,
    failing_stops: Mutex<HashSet<String>>,
    severity_codes: Mutex<Vec<SeverityCode>>,
    failing_disruption_fetches: AtomicU32,
    disruption_latency_ms: AtomicU64,
    disruption_fetches: AtomicU64,
    arrival_fetches: AtomicU64,
}

impl ScriptedFeedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a snapshot to be served by the next `fetch_disruptions`.
    pub fn push_snapshot(&self, snapshot: Vec<RawDisruption>) {
        self.snapshots.lock().unwrap().push_back(snapshot);
    }

    /// Serve these predictions for every arrivals request at `stop_id`.
    pub fn set_arrivals(&self, stop_id: &str, predictions: Vec<ArrivalPrediction>) {
        self.arrivals
            .lock()
            .unwrap()
            .insert(stop_id.to_string(), predictions);
    }

    /// Make arrivals requests at `stop_id` fail.
    pub fn fail_stop(&self, stop_id: &str) {
        self.failing_stops.lock().unwrap().insert(stop_id.to_string());
    }

    pub fn set_severity_codes(&self, codes: Vec<SeverityCode>) {
        *self.severity_codes.lock().unwrap() = codes;
    }

    /// Fail the next `n` disruption fetches with a transport error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.failing_disruption_fetches.store(n, Ordering::SeqCst);
    }

    /// Delay every disruption fetch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.disruption_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn disruption_fetches(&self) -> u64 {
        self.disruption_fetches.load(Ordering::SeqCst)
    }

    pub fn arrival_fetches(&self) -> u64 {
        self.arrival_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedClient for ScriptedFeedClient {
    async fn fetch_disruptions(&self, modes: &[String]) -> FeedResult<Vec<RawDisruption>> {
        self.disruption_fetches.fetch_add(1, Ordering::SeqCst);

        let latency = self.disruption_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failing = self
            .failing_disruption_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FeedError::Transport("injected feed outage".into()));
        }

        let snapshot = match self.snapshots.lock().unwrap().pop_front() {
            Some(next) => {
                *self.last_snapshot.lock().unwrap() = next.clone();
                next
            }
            None => self.last_snapshot.lock().unwrap().clone(),
        };

        Ok(snapshot
            .into_iter()
            .filter(|d| {
                d.mode
                    .as_ref()
                    .map_or(true, |m| modes.is_empty() || modes.contains(m))
            })
            .collect())
    }

    async fn fetch_arrivals(
        &self,
        line_ids: &[String],
        stop_id: &str,
        _direction: Option<&str>,
    ) -> FeedResult<Vec<ArrivalPrediction>> {
        self.arrival_fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing_stops.lock().unwrap().contains(stop_id) {
            return Err(FeedError::Status {
                status: 503,
                endpoint: format!("arrivals/{stop_id}"),
            });
        }
        let arrivals = self.arrivals.lock().unwrap();
        Ok(arrivals
            .get(stop_id)
            .map(|predictions| {
                predictions
                    .iter()
                    .filter(|p| line_ids.is_empty() || line_ids.contains(&p.line_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_severity_codes(&self) -> FeedResult<Vec<SeverityCode>> {
        Ok(self.severity_codes.lock().unwrap().clone())
    }
}
