//! Feed-facing data types
//!
//! These are the normalised shapes the learner consumes. The HTTP client
//! maps the upstream wire format into them; the core never sees raw JSON
//! other than through `serde_json::Value` payload snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a route section's ordered stop sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionEntry {
    pub ordinal: i32,
    /// Missing for entries the feed could not resolve to a stop
    pub stop_id: Option<String>,
    pub name: Option<String>,
}

/// A route affected by a disruption.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedRoute {
    pub id: Option<String>,
    pub line_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub section: Vec<SectionEntry>,
}

/// A stop affected by a disruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedStop {
    pub stop_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub lines: Vec<String>,
}

/// A disruption as reported by the feed, before classification.
///
/// Required fields (`line_id`, `mode`, `description`) are optional here so
/// malformed upstream items can be detected and counted downstream rather
/// than failing the whole snapshot decode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDisruption {
    pub line_id: Option<String>,
    pub mode: Option<String>,
    pub category: Option<String>,
    pub disruption_type: Option<String>,
    pub category_description: Option<String>,
    pub description: Option<String>,
    pub summary: Option<String>,
    pub additional_info: Option<String>,
    pub closure_text: Option<String>,
    pub severity_label: Option<String>,
    pub severity_level: Option<i32>,
    pub created: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub affected_routes: Vec<AffectedRoute>,
    #[serde(default)]
    pub affected_stops: Vec<AffectedStop>,
}

/// A live arrival prediction at a stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalPrediction {
    pub line_id: String,
    pub stop_id: String,
    pub expected_arrival: DateTime<Utc>,
    pub vehicle_id: Option<String>,
    pub platform_name: Option<String>,
    pub direction: Option<String>,
}

/// A severity code published by the feed for one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityCode {
    pub mode: String,
    pub level: i32,
    pub description: String,
}

/// A stop together with the lines serving it (topology import).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPointLines {
    pub stop_id: String,
    pub name: Option<String>,
    pub lines: Vec<String>,
}
