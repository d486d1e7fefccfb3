//! SurrealDB-backed implementation of every storage trait
//!
//! Uses the `schema` row types for persistence, converting to/from
//! `storage_traits` types at the boundary.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::schema::{DisruptionRow, SampleRow, SeverityRow, StopLineRow};
use crate::storage_traits::{
    DelaySample, DisruptionId, DisruptionRecord, DisruptionStore, MajorStop, SampleStore,
    SeverityKey, SeverityLevelEstimate, SeverityStore, StorageResult, TopologyStore,
};

const DISRUPTIONS: &str = "disruptions";
const SEVERITY_LEVELS: &str = "severity_levels";
const DELAY_SAMPLES: &str = "delay_samples";
const STOP_LINES: &str = "stop_lines";

/// SurrealDB-backed transit store.
#[derive(Clone)]
pub struct SurrealTransitStore {
    db: Surreal<Any>,
}

impl SurrealTransitStore {
    /// Wrap an already connected and initialised client.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://").await?;
        info!("SurrealTransitStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables (see [`handle::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env().await?;
        Ok(Self { db })
    }

    /// Record the lines serving a stop. Used by topology import.
    pub async fn put_stop_lines(
        &self,
        stop_id: &str,
        stop_name: Option<&str>,
        line_ids: &[String],
    ) -> StorageResult<usize> {
        for line_id in line_ids {
            let row = StopLineRow {
                stop_id: stop_id.to_string(),
                stop_name: stop_name.map(str::to_string),
                line_id: line_id.clone(),
            };
            let _stored: Option<StopLineRow> = self
                .db
                .upsert((STOP_LINES, format!("{stop_id}__{line_id}")))
                .content(row)
                .await?;
        }
        debug!(stop_id, lines = line_ids.len(), "stop lines recorded");
        Ok(line_ids.len())
    }

    async fn fetch_disruption_row(&self, id: &DisruptionId) -> StorageResult<Option<DisruptionRow>> {
        let row: Option<DisruptionRow> = self.db.select((DISRUPTIONS, id.0.clone())).await?;
        Ok(row)
    }
}

#[async_trait]
impl DisruptionStore for SurrealTransitStore {
    async fn upsert_disruption(&self, record: &DisruptionRecord) -> StorageResult<()> {
        if let Some(existing) = self.fetch_disruption_row(&record.id).await? {
            if existing.state == "resolved" {
                return Err(StorageError::ImmutableRecord {
                    id: record.id.0.clone(),
                });
            }
        }

        debug!(disruption_id = %record.id, state = record.state.as_str(), "upserting disruption");

        let _stored: Option<DisruptionRow> = self
            .db
            .upsert((DISRUPTIONS, record.id.0.clone()))
            .content(DisruptionRow::from(record))
            .await?;
        Ok(())
    }

    async fn get_disruption(&self, id: &DisruptionId) -> StorageResult<Option<DisruptionRecord>> {
        self.fetch_disruption_row(id)
            .await?
            .map(DisruptionRecord::try_from)
            .transpose()
    }

    async fn list_active(&self) -> StorageResult<Vec<DisruptionRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM disruptions WHERE state != 'resolved' ORDER BY disruption_id ASC")
            .await?;
        let rows: Vec<DisruptionRow> = res.take(0)?;
        rows.into_iter().map(DisruptionRecord::try_from).collect()
    }

    async fn list_resolved_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<DisruptionRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM disruptions WHERE state = 'resolved' AND resolved_at >= $since \
                 ORDER BY resolved_at DESC",
            )
            .bind(("since", SurrealDatetime::from(since)))
            .await?;
        let rows: Vec<DisruptionRow> = res.take(0)?;
        rows.into_iter().map(DisruptionRecord::try_from).collect()
    }
}

#[async_trait]
impl SeverityStore for SurrealTransitStore {
    async fn get_estimate(&self, key: &SeverityKey) -> StorageResult<Option<SeverityLevelEstimate>> {
        let row: Option<SeverityRow> = self
            .db
            .select((SEVERITY_LEVELS, key.storage_key()))
            .await?;
        Ok(row.map(SeverityLevelEstimate::from))
    }

    async fn upsert_estimate(&self, estimate: &SeverityLevelEstimate) -> StorageResult<()> {
        let _stored: Option<SeverityRow> = self
            .db
            .upsert((SEVERITY_LEVELS, estimate.key.storage_key()))
            .content(SeverityRow::from(estimate))
            .await?;
        Ok(())
    }

    async fn list_estimates(&self) -> StorageResult<Vec<SeverityLevelEstimate>> {
        let mut res = self
            .db
            .query("SELECT * FROM severity_levels ORDER BY mode ASC, level ASC")
            .await?;
        let rows: Vec<SeverityRow> = res.take(0)?;
        Ok(rows.into_iter().map(SeverityLevelEstimate::from).collect())
    }
}

#[async_trait]
impl SampleStore for SurrealTransitStore {
    async fn append_sample(&self, sample: &DelaySample) -> StorageResult<()> {
        let _created: Option<SampleRow> = self
            .db
            .create((DELAY_SAMPLES, sample.sample_id.clone()))
            .content(SampleRow::from(sample))
            .await?;
        Ok(())
    }

    async fn samples_since(
        &self,
        key: &SeverityKey,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<DelaySample>> {
        let rows: Vec<SampleRow> = match since {
            Some(since) => {
                let mut res = self
                    .db
                    .query(
                        "SELECT * FROM delay_samples WHERE mode = $mode AND level = $level \
                         AND sampled_at > $since ORDER BY sampled_at ASC",
                    )
                    .bind(("mode", key.mode.clone()))
                    .bind(("level", key.level))
                    .bind(("since", SurrealDatetime::from(since)))
                    .await?;
                res.take(0)?
            }
            None => {
                let mut res = self
                    .db
                    .query(
                        "SELECT * FROM delay_samples WHERE mode = $mode AND level = $level \
                         ORDER BY sampled_at ASC",
                    )
                    .bind(("mode", key.mode.clone()))
                    .bind(("level", key.level))
                    .await?;
                res.take(0)?
            }
        };
        Ok(rows.into_iter().map(DelaySample::from).collect())
    }
}

#[async_trait]
impl TopologyStore for SurrealTransitStore {
    async fn major_stops(&self, min_lines: u32, limit: usize) -> StorageResult<Vec<MajorStop>> {
        let mut res = self.db.query("SELECT * FROM stop_lines").await?;
        let rows: Vec<StopLineRow> = res.take(0)?;

        let mut grouped: BTreeMap<String, (Option<String>, BTreeSet<String>)> = BTreeMap::new();
        for row in rows {
            let entry = grouped
                .entry(row.stop_id)
                .or_insert_with(|| (row.stop_name.clone(), BTreeSet::new()));
            if entry.0.is_none() {
                entry.0 = row.stop_name;
            }
            entry.1.insert(row.line_id);
        }

        let mut major: Vec<MajorStop> = grouped
            .into_iter()
            .map(|(stop_id, (name, lines))| MajorStop {
                stop_id,
                name,
                line_count: lines.len() as u32,
            })
            .filter(|s| s.line_count >= min_lines)
            .collect();
        major.sort_by(|a, b| {
            b.line_count
                .cmp(&a.line_count)
                .then_with(|| a.stop_id.cmp(&b.stop_id))
        });
        major.truncate(limit);
        Ok(major)
    }
}
