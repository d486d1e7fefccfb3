//! TfL Unified API client
//!
//! Implements [`FeedClient`] over HTTPS with reqwest. Disruptions are read
//! from the per-mode line status endpoint and flattened to one
//! [`RawDisruption`] per disrupted line status; every request is sent with
//! `Cache-Control: no-cache` so snapshots are always live.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::CACHE_CONTROL;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::client::FeedClient;
use crate::error::{FeedError, FeedResult};
use crate::types::{
    AffectedRoute, AffectedStop, ArrivalPrediction, RawDisruption, SectionEntry, SeverityCode,
    StopPointLines,
};

const DEFAULT_BASE_URL: &str = "https://api.tfl.gov.uk";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// TfL client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TflConfig {
    /// API base URL
    pub base_url: String,
    /// Application key (optional; anonymous access is heavily rate limited)
    pub app_key: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for TflConfig {
    fn default() -> Self {
        TflConfig {
            base_url: std::env::var("TFL_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            app_key: std::env::var("TFL_APP_KEY")
                .or_else(|_| std::env::var("TFL_SECONDARY_KEY"))
                .ok()
                .filter(|k| !k.is_empty()),
            timeout_secs: std::env::var("TFL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl TflConfig {
    /// Create config from environment variables
    ///
    /// Reads `TFL_BASE_URL`, `TFL_APP_KEY` (falling back to
    /// `TFL_SECONDARY_KEY`) and `TFL_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific endpoint without credentials
    pub fn new(base_url: &str) -> Self {
        TflConfig {
            base_url: base_url.to_string(),
            app_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Set the application key
    pub fn with_app_key(mut self, key: &str) -> Self {
        self.app_key = Some(key.to_string());
        self
    }

    /// Set the request timeout
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// HTTP client for the TfL Unified API
pub struct TflClient {
    config: TflConfig,
    http_client: reqwest::Client,
}

impl TflClient {
    /// Create a new client
    pub fn new(config: TflConfig) -> FeedResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("transit-pulse/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FeedError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(TflClient {
            config,
            http_client,
        })
    }

    /// Create a client from environment variables; an application key is required.
    pub fn from_env() -> FeedResult<Self> {
        let config = TflConfig::from_env();
        if config.app_key.is_none() {
            return Err(FeedError::MissingCredentials(
                "TFL_APP_KEY (or TFL_SECONDARY_KEY) not set".into(),
            ));
        }
        Self::new(config)
    }

    pub fn config(&self) -> &TflConfig {
        &self.config
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> FeedResult<T> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self
            .http_client
            .get(&url)
            .header(CACHE_CONTROL, "no-cache")
            .query(query);
        if let Some(key) = &self.config.app_key {
            request = request.query(&[("app_key", key)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                endpoint: path.to_string(),
            });
        }
        let body = response.bytes().await?;
        debug!(path, bytes = body.len(), "feed response received");
        Ok(serde_json::from_slice(&body)?)
    }

    /// Every stop served by lines of the given modes, with its serving lines.
    #[instrument(skip(self))]
    pub async fn fetch_stop_points(&self, modes: &[String]) -> FeedResult<Vec<StopPointLines>> {
        let lines: Vec<WireLineRef> = self
            .get_json(&format!("Line/Mode/{}", modes.join(",")), &[])
            .await?;

        let mut stops: BTreeMap<String, StopPointLines> = BTreeMap::new();
        for line in lines {
            let points: Vec<WireStopPoint> = match self
                .get_json(&format!("Line/{}/StopPoints", line.id), &[])
                .await
            {
                Ok(points) => points,
                Err(e) => {
                    warn!(line_id = %line.id, error = %e, "skipping line during stop import");
                    continue;
                }
            };
            for point in points {
                let Some(stop_id) = point.naptan_id.clone() else {
                    continue;
                };
                let entry = stops.entry(stop_id.clone()).or_insert_with(|| StopPointLines {
                    stop_id,
                    name: point.display_name(),
                    lines: Vec::new(),
                });
                if !entry.lines.contains(&line.id) {
                    entry.lines.push(line.id.clone());
                }
            }
        }
        Ok(stops.into_values().collect())
    }
}

#[async_trait]
impl FeedClient for TflClient {
    #[instrument(skip(self))]
    async fn fetch_disruptions(&self, modes: &[String]) -> FeedResult<Vec<RawDisruption>> {
        let lines: Vec<WireLine> = self
            .get_json(
                &format!("Line/Mode/{}/Status", modes.join(",")),
                &[("detail", "true".to_string())],
            )
            .await?;
        Ok(disruptions_from_lines(lines))
    }

    #[instrument(skip(self))]
    async fn fetch_arrivals(
        &self,
        line_ids: &[String],
        stop_id: &str,
        direction: Option<&str>,
    ) -> FeedResult<Vec<ArrivalPrediction>> {
        let query: Vec<(&str, String)> = direction
            .map(|d| vec![("direction", d.to_string())])
            .unwrap_or_default();
        let arrivals: Vec<WireArrival> = self
            .get_json(
                &format!("Line/{}/Arrivals/{}", line_ids.join(","), stop_id),
                &query,
            )
            .await?;
        Ok(arrivals.into_iter().filter_map(WireArrival::into_prediction).collect())
    }

    async fn fetch_severity_codes(&self) -> FeedResult<Vec<SeverityCode>> {
        let codes: Vec<WireSeverity> = self.get_json("Line/Meta/Severity", &[]).await?;
        Ok(codes
            .into_iter()
            .map(|c| SeverityCode {
                mode: c.mode_name,
                level: c.severity_level,
                description: c.description,
            })
            .collect())
    }
}

/// Parse a feed timestamp; accepts RFC 3339 and zone-less ISO 8601 (read as UTC).
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    match NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => Some(naive.and_utc()),
        Err(_) => {
            debug!(raw, "unparseable feed timestamp");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLine {
    id: String,
    mode_name: Option<String>,
    #[serde(default)]
    line_statuses: Vec<WireLineStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLineStatus {
    status_severity: Option<i32>,
    status_severity_description: Option<String>,
    disruption: Option<WireDisruption>,
    #[serde(default)]
    validity_periods: Vec<WireValidity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireValidity {
    from_date: Option<String>,
    to_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDisruption {
    category: Option<String>,
    #[serde(rename = "type")]
    disruption_type: Option<String>,
    category_description: Option<String>,
    description: Option<String>,
    summary: Option<String>,
    additional_info: Option<String>,
    created: Option<String>,
    last_update: Option<String>,
    closure_text: Option<String>,
    #[serde(default)]
    affected_routes: Vec<WireRoute>,
    #[serde(default)]
    affected_stops: Vec<WireStopPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRoute {
    id: Option<String>,
    line_id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    route_section_naptan_entry_sequence: Vec<WireSectionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSectionEntry {
    ordinal: Option<i32>,
    stop_point: Option<WireStopPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStopPoint {
    naptan_id: Option<String>,
    common_name: Option<String>,
    name: Option<String>,
    #[serde(default)]
    lines: Vec<WireLineRef>,
}

impl WireStopPoint {
    fn display_name(&self) -> Option<String> {
        self.common_name.clone().or_else(|| self.name.clone())
    }
}

#[derive(Debug, Deserialize)]
struct WireLineRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireArrival {
    line_id: Option<String>,
    naptan_id: Option<String>,
    expected_arrival: Option<String>,
    vehicle_id: Option<String>,
    platform_name: Option<String>,
    direction: Option<String>,
}

impl WireArrival {
    fn into_prediction(self) -> Option<ArrivalPrediction> {
        Some(ArrivalPrediction {
            line_id: self.line_id?,
            stop_id: self.naptan_id?,
            expected_arrival: parse_timestamp(self.expected_arrival.as_deref())?,
            vehicle_id: self.vehicle_id,
            platform_name: self.platform_name,
            direction: self.direction,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSeverity {
    mode_name: String,
    severity_level: i32,
    description: String,
}

/// Flatten line statuses into one raw disruption per disrupted status.
fn disruptions_from_lines(lines: Vec<WireLine>) -> Vec<RawDisruption> {
    let mut out = Vec::new();
    for line in lines {
        for status in line.line_statuses {
            let Some(d) = status.disruption else {
                continue;
            };
            let valid_from = status
                .validity_periods
                .first()
                .and_then(|p| parse_timestamp(p.from_date.as_deref()));
            let valid_to = status
                .validity_periods
                .last()
                .and_then(|p| parse_timestamp(p.to_date.as_deref()));

            out.push(RawDisruption {
                line_id: Some(line.id.clone()),
                mode: line.mode_name.clone(),
                category: d.category,
                disruption_type: d.disruption_type,
                category_description: d.category_description,
                description: d.description,
                summary: d.summary,
                additional_info: d.additional_info,
                closure_text: d.closure_text,
                severity_label: status.status_severity_description,
                severity_level: status.status_severity,
                created: parse_timestamp(d.created.as_deref()),
                last_update: parse_timestamp(d.last_update.as_deref()),
                valid_from,
                valid_to,
                affected_routes: d.affected_routes.into_iter().map(route_from_wire).collect(),
                affected_stops: d
                    .affected_stops
                    .into_iter()
                    .filter_map(stop_from_wire)
                    .collect(),
            });
        }
    }
    out
}

fn route_from_wire(route: WireRoute) -> AffectedRoute {
    AffectedRoute {
        id: route.id,
        line_id: route.line_id,
        name: route.name,
        section: route
            .route_section_naptan_entry_sequence
            .into_iter()
            .map(|entry| {
                let (stop_id, name) = match entry.stop_point {
                    Some(point) => {
                        let name = point.display_name();
                        (point.naptan_id, name)
                    }
                    None => (None, None),
                };
                SectionEntry {
                    ordinal: entry.ordinal.unwrap_or(0),
                    stop_id,
                    name,
                }
            })
            .collect(),
    }
}

fn stop_from_wire(point: WireStopPoint) -> Option<AffectedStop> {
    let name = point.display_name();
    Some(AffectedStop {
        stop_id: point.naptan_id?,
        name,
        lines: point.lines.into_iter().map(|l| l.id).collect(),
    })
}
