//! Storage trait definitions for Transit Pulse
//!
//! These traits define the persistence collaborators the learner depends on:
//! - `DisruptionStore`: disruption lifecycle records (upsert/query)
//! - `SeverityStore`: per-(mode, level) delay estimates
//! - `SampleStore`: append-only delay samples
//! - `TopologyStore`: the major interchange stop query
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Disruption records
// ---------------------------------------------------------------------------

/// Stable identity of a tracked disruption.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisruptionId(pub String);

impl DisruptionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisruptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a [`DisruptionId`] was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityBasis {
    /// Keyed on line, category, type and the upstream creation timestamp.
    CreatedTimestamp,
    /// Creation timestamp was absent; keyed on a hash of the description text.
    TextHash,
}

impl IdentityBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityBasis::CreatedTimestamp => "created_timestamp",
            IdentityBasis::TextHash => "text_hash",
        }
    }
}

/// Suspension classification of a disruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    #[default]
    None,
    Partial,
    Full,
}

impl SuspensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspensionKind::None => "none",
            SuspensionKind::Partial => "partial",
            SuspensionKind::Full => "full",
        }
    }
}

impl std::str::FromStr for SuspensionKind {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(SuspensionKind::None),
            "partial" => Ok(SuspensionKind::Partial),
            "full" => Ok(SuspensionKind::Full),
            other => Err(StorageError::Serialization(format!(
                "unknown suspension kind: {other}"
            ))),
        }
    }
}

/// Boundary stops of a partially suspended section.
///
/// Both ends are always present together; a record either carries a full
/// section or none at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionBounds {
    pub start: String,
    pub end: String,
}

/// Lifecycle state of a disruption.
///
/// A record moves `New -> (Active | Updated)* -> Resolved`. `Resolved` is
/// terminal: the record is immutable and its identity never re-enters.
///
/// The state names the last written transition. A cycle that sees a record
/// unchanged writes nothing and leaves the state alone, so `New` and
/// `Updated` persist until the next change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    New,
    /// Carried over a restart without a change since
    Active,
    Updated,
    Resolved,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::New => "new",
            LifecycleState::Active => "active",
            LifecycleState::Updated => "updated",
            LifecycleState::Resolved => "resolved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Resolved)
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new" => Ok(LifecycleState::New),
            "active" => Ok(LifecycleState::Active),
            "updated" => Ok(LifecycleState::Updated),
            "resolved" => Ok(LifecycleState::Resolved),
            other => Err(StorageError::Serialization(format!(
                "unknown lifecycle state: {other}"
            ))),
        }
    }
}

/// A disruption as tracked across feed snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisruptionRecord {
    pub id: DisruptionId,
    pub identity_basis: IdentityBasis,
    pub mode: String,
    pub line_id: String,
    pub category: String,
    pub disruption_type: String,
    pub category_description: Option<String>,
    pub description: String,
    pub summary: Option<String>,
    pub additional_info: Option<String>,
    pub closure_text: Option<String>,
    /// Severity label as reported upstream (e.g. "Severe Delays")
    pub severity_label: Option<String>,
    /// Numeric severity level as reported upstream
    pub severity_level: Option<i32>,
    pub suspension: SuspensionKind,
    /// Present only for partial suspensions with a resolvable section
    pub section: Option<SectionBounds>,
    /// Opaque affected-route payload, stored as received
    pub affected_routes: serde_json::Value,
    /// Opaque affected-stop payload, stored as received
    pub affected_stops: serde_json::Value,
    pub created: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub state: LifecycleState,
}

impl DisruptionRecord {
    /// Whether the record is still part of the active set.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Severity context the record contributes to, if a level was reported.
    pub fn severity_key(&self) -> Option<SeverityKey> {
        self.severity_level
            .map(|level| SeverityKey::new(self.mode.clone(), level))
    }
}

// ---------------------------------------------------------------------------
// Severity estimates
// ---------------------------------------------------------------------------

/// Key of a learned severity estimate: (transport mode, severity level).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeverityKey {
    pub mode: String,
    pub level: i32,
}

impl SeverityKey {
    pub fn new(mode: impl Into<String>, level: i32) -> Self {
        Self {
            mode: mode.into(),
            level,
        }
    }

    /// Record-id safe form, e.g. `elizabeth_line_6`.
    pub fn storage_key(&self) -> String {
        format!("{}_{}", self.mode.replace('-', "_"), self.level)
    }
}

impl fmt::Display for SeverityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/L{}", self.mode, self.level)
    }
}

/// Learned delay estimate for one severity level of one mode.
///
/// Invariants: `estimated_delay_minutes >= 0`, `confidence_score` within
/// `[0, 0.95]`; `sample_count` and `confidence_score` never decrease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityLevelEstimate {
    pub key: SeverityKey,
    pub description: String,
    pub estimated_delay_minutes: f64,
    pub confidence_score: f64,
    pub sample_count: u64,
    pub is_suspension: bool,
    pub last_updated: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Delay samples
// ---------------------------------------------------------------------------

/// One observed inter-arrival interval, attributed to a severity context.
///
/// Append-only; never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelaySample {
    pub sample_id: String,
    pub stop_id: String,
    pub line_id: String,
    pub sampled_at: DateTime<Utc>,
    pub expected_interval_secs: f64,
    pub observed_interval_secs: f64,
    pub excess_delay_minutes: f64,
    pub key: SeverityKey,
    pub disruption_id: DisruptionId,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// An interchange stop and the number of distinct lines serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MajorStop {
    pub stop_id: String,
    pub name: Option<String>,
    pub line_count: u32,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Disruption record persistence.
///
/// Guarantees:
/// - `upsert_disruption` is keyed on `record.id` and is all-or-nothing.
/// - A record stored in state `Resolved` is immutable; further upserts fail
///   with `StorageError::ImmutableRecord`.
#[async_trait]
pub trait DisruptionStore: Send + Sync {
    /// Insert or replace a record by identity.
    async fn upsert_disruption(&self, record: &DisruptionRecord) -> StorageResult<()>;

    /// Fetch a record by identity.
    async fn get_disruption(&self, id: &DisruptionId) -> StorageResult<Option<DisruptionRecord>>;

    /// All records not yet resolved.
    async fn list_active(&self) -> StorageResult<Vec<DisruptionRecord>>;

    /// Records resolved at or after `since`, newest first.
    async fn list_resolved_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<DisruptionRecord>>;
}

/// Severity estimate persistence.
#[async_trait]
pub trait SeverityStore: Send + Sync {
    /// Fetch the estimate for a key.
    async fn get_estimate(&self, key: &SeverityKey) -> StorageResult<Option<SeverityLevelEstimate>>;

    /// Insert or replace an estimate by key.
    async fn upsert_estimate(&self, estimate: &SeverityLevelEstimate) -> StorageResult<()>;

    /// All estimates, ordered by key.
    async fn list_estimates(&self) -> StorageResult<Vec<SeverityLevelEstimate>>;
}

/// Append-only delay sample persistence.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Append a sample. Samples are never updated.
    async fn append_sample(&self, sample: &DelaySample) -> StorageResult<()>;

    /// Samples for a key taken strictly after `since` (all when `None`),
    /// oldest first.
    async fn samples_since(
        &self,
        key: &SeverityKey,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<DelaySample>>;
}

/// Read-only view of network topology needed for sampling.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Stops served by at least `min_lines` distinct lines, busiest first,
    /// truncated to `limit`.
    async fn major_stops(&self, min_lines: u32, limit: usize) -> StorageResult<Vec<MajorStop>>;
}

/// Everything the learner persists, as one object.
pub trait TransitStore: DisruptionStore + SeverityStore + SampleStore + TopologyStore {}

impl<T> TransitStore for T where T: DisruptionStore + SeverityStore + SampleStore + TopologyStore {}
