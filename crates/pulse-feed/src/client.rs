//! The feed collaborator trait

use async_trait::async_trait;

use crate::error::FeedResult;
use crate::types::{ArrivalPrediction, RawDisruption, SeverityCode};

/// Read-only access to the live status feed.
///
/// Guarantees:
/// - `fetch_disruptions` always reflects the live feed (never served from a cache).
/// - Every call is independent; implementations hold no per-cycle state.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Currently reported disruptions for the given modes.
    async fn fetch_disruptions(&self, modes: &[String]) -> FeedResult<Vec<RawDisruption>>;

    /// Arrival predictions at `stop_id` for the given lines.
    async fn fetch_arrivals(
        &self,
        line_ids: &[String],
        stop_id: &str,
        direction: Option<&str>,
    ) -> FeedResult<Vec<ArrivalPrediction>>;

    /// Severity codes published per mode.
    async fn fetch_severity_codes(&self) -> FeedResult<Vec<SeverityCode>>;
}
