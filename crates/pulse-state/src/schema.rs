//! Row definitions for Transit Pulse SurrealDB tables
//!
//! Tables:
//! - disruptions: lifecycle records keyed by disruption identity
//! - severity_levels: learned estimates keyed by (mode, level)
//! - delay_samples: append-only arrival observations
//! - stop_lines: (stop, line) pairs used to answer the major-stop query
//!
//! Rows are the stored shape; conversion to the `storage_traits` types
//! happens at this boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    DelaySample, DisruptionId, DisruptionRecord, IdentityBasis, LifecycleState, SectionBounds,
    SeverityKey, SeverityLevelEstimate,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Stored form of a [`DisruptionRecord`].
///
/// Section boundaries are flattened into two nullable columns; the
/// conversion back refuses rows where exactly one is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisruptionRow {
    pub disruption_id: String,
    pub identity_basis: String,
    pub mode: String,
    pub line_id: String,
    pub category: String,
    pub disruption_type: String,
    pub category_description: Option<String>,
    pub description: String,
    pub summary: Option<String>,
    pub additional_info: Option<String>,
    pub closure_text: Option<String>,
    pub severity_label: Option<String>,
    pub severity_level: Option<i32>,
    pub suspension: String,
    pub section_start: Option<String>,
    pub section_end: Option<String>,
    pub affected_routes: serde_json::Value,
    pub affected_stops: serde_json::Value,
    #[serde(default, with = "surreal_datetime_opt")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(with = "surreal_datetime")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub last_seen: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub state: String,
}

impl From<&DisruptionRecord> for DisruptionRow {
    fn from(record: &DisruptionRecord) -> Self {
        let (section_start, section_end) = match &record.section {
            Some(bounds) => (Some(bounds.start.clone()), Some(bounds.end.clone())),
            None => (None, None),
        };
        DisruptionRow {
            disruption_id: record.id.0.clone(),
            identity_basis: record.identity_basis.as_str().to_string(),
            mode: record.mode.clone(),
            line_id: record.line_id.clone(),
            category: record.category.clone(),
            disruption_type: record.disruption_type.clone(),
            category_description: record.category_description.clone(),
            description: record.description.clone(),
            summary: record.summary.clone(),
            additional_info: record.additional_info.clone(),
            closure_text: record.closure_text.clone(),
            severity_label: record.severity_label.clone(),
            severity_level: record.severity_level,
            suspension: record.suspension.as_str().to_string(),
            section_start,
            section_end,
            affected_routes: record.affected_routes.clone(),
            affected_stops: record.affected_stops.clone(),
            created: record.created,
            last_update: record.last_update,
            valid_from: record.valid_from,
            valid_to: record.valid_to,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            resolved_at: record.resolved_at,
            state: record.state.as_str().to_string(),
        }
    }
}

impl TryFrom<DisruptionRow> for DisruptionRecord {
    type Error = StorageError;

    fn try_from(row: DisruptionRow) -> Result<Self, Self::Error> {
        let section = match (row.section_start, row.section_end) {
            (Some(start), Some(end)) => Some(SectionBounds { start, end }),
            (None, None) => None,
            _ => {
                return Err(StorageError::Serialization(format!(
                    "disruption {} has a half-open section",
                    row.disruption_id
                )))
            }
        };
        let identity_basis = match row.identity_basis.as_str() {
            "created_timestamp" => IdentityBasis::CreatedTimestamp,
            "text_hash" => IdentityBasis::TextHash,
            other => {
                return Err(StorageError::Serialization(format!(
                    "unknown identity basis: {other}"
                )))
            }
        };
        Ok(DisruptionRecord {
            id: DisruptionId(row.disruption_id),
            identity_basis,
            mode: row.mode,
            line_id: row.line_id,
            category: row.category,
            disruption_type: row.disruption_type,
            category_description: row.category_description,
            description: row.description,
            summary: row.summary,
            additional_info: row.additional_info,
            closure_text: row.closure_text,
            severity_label: row.severity_label,
            severity_level: row.severity_level,
            suspension: row.suspension.parse()?,
            section,
            affected_routes: row.affected_routes,
            affected_stops: row.affected_stops,
            created: row.created,
            last_update: row.last_update,
            valid_from: row.valid_from,
            valid_to: row.valid_to,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            resolved_at: row.resolved_at,
            state: row.state.parse::<LifecycleState>()?,
        })
    }
}

/// Stored form of a [`SeverityLevelEstimate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityRow {
    pub mode: String,
    pub level: i32,
    pub description: String,
    pub estimated_delay_minutes: f64,
    pub confidence_score: f64,
    pub sample_count: u64,
    pub is_suspension: bool,
    #[serde(with = "surreal_datetime")]
    pub last_updated: DateTime<Utc>,
}

impl From<&SeverityLevelEstimate> for SeverityRow {
    fn from(estimate: &SeverityLevelEstimate) -> Self {
        SeverityRow {
            mode: estimate.key.mode.clone(),
            level: estimate.key.level,
            description: estimate.description.clone(),
            estimated_delay_minutes: estimate.estimated_delay_minutes,
            confidence_score: estimate.confidence_score,
            sample_count: estimate.sample_count,
            is_suspension: estimate.is_suspension,
            last_updated: estimate.last_updated,
        }
    }
}

impl From<SeverityRow> for SeverityLevelEstimate {
    fn from(row: SeverityRow) -> Self {
        SeverityLevelEstimate {
            key: SeverityKey::new(row.mode, row.level),
            description: row.description,
            estimated_delay_minutes: row.estimated_delay_minutes,
            confidence_score: row.confidence_score,
            sample_count: row.sample_count,
            is_suspension: row.is_suspension,
            last_updated: row.last_updated,
        }
    }
}

/// Stored form of a [`DelaySample`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRow {
    pub sample_id: String,
    pub stop_id: String,
    pub line_id: String,
    #[serde(with = "surreal_datetime")]
    pub sampled_at: DateTime<Utc>,
    pub expected_interval_secs: f64,
    pub observed_interval_secs: f64,
    pub excess_delay_minutes: f64,
    pub mode: String,
    pub level: i32,
    pub disruption_id: String,
}

impl From<&DelaySample> for SampleRow {
    fn from(sample: &DelaySample) -> Self {
        SampleRow {
            sample_id: sample.sample_id.clone(),
            stop_id: sample.stop_id.clone(),
            line_id: sample.line_id.clone(),
            sampled_at: sample.sampled_at,
            expected_interval_secs: sample.expected_interval_secs,
            observed_interval_secs: sample.observed_interval_secs,
            excess_delay_minutes: sample.excess_delay_minutes,
            mode: sample.key.mode.clone(),
            level: sample.key.level,
            disruption_id: sample.disruption_id.0.clone(),
        }
    }
}

impl From<SampleRow> for DelaySample {
    fn from(row: SampleRow) -> Self {
        DelaySample {
            sample_id: row.sample_id,
            stop_id: row.stop_id,
            line_id: row.line_id,
            sampled_at: row.sampled_at,
            expected_interval_secs: row.expected_interval_secs,
            observed_interval_secs: row.observed_interval_secs,
            excess_delay_minutes: row.excess_delay_minutes,
            key: SeverityKey::new(row.mode, row.level),
            disruption_id: DisruptionId(row.disruption_id),
        }
    }
}

/// One (stop, line) service pair from the static topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLineRow {
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub line_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::SuspensionKind;
    use serde_json::json;

    fn record() -> DisruptionRecord {
        let now = Utc::now();
        DisruptionRecord {
            id: DisruptionId("disr-real-00aa11bb22cc33dd".into()),
            identity_basis: IdentityBasis::CreatedTimestamp,
            mode: "tube".into(),
            line_id: "northern".into(),
            category: "RealTime".into(),
            disruption_type: "routeBlocking".into(),
            category_description: None,
            description: "Part suspended between Camden Town and Edgware".into(),
            summary: None,
            additional_info: None,
            closure_text: Some("partClosure".into()),
            severity_label: Some("Part Suspended".into()),
            severity_level: Some(3),
            suspension: SuspensionKind::Partial,
            section: Some(SectionBounds {
                start: "940GZZLUCTN".into(),
                end: "940GZZLUEGW".into(),
            }),
            affected_routes: json!([]),
            affected_stops: json!([]),
            created: Some(now),
            last_update: Some(now),
            valid_from: None,
            valid_to: None,
            first_seen: now,
            last_seen: now,
            resolved_at: None,
            state: LifecycleState::New,
        }
    }

    #[test]
    fn disruption_row_flattens_section() {
        let original = record();
        let row = DisruptionRow::from(&original);
        assert_eq!(row.section_start.as_deref(), Some("940GZZLUCTN"));
        assert_eq!(row.section_end.as_deref(), Some("940GZZLUEGW"));
        assert_eq!(row.suspension, "partial");
        assert_eq!(row.state, "new");

        let back = DisruptionRecord::try_from(row).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn half_open_section_is_rejected() {
        let mut row = DisruptionRow::from(&record());
        row.section_end = None;
        let err = DisruptionRecord::try_from(row).unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let mut row = DisruptionRow::from(&record());
        row.state = "archived".into();
        assert!(DisruptionRecord::try_from(row).is_err());
    }
}
