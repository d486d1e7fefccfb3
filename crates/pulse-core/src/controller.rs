//! Learning controller: one poll cycle end to end.
//!
//! fetch -> classify -> reconcile -> persist -> (sample -> buffer) -> merge.
//! The disruption table is swapped in only after its writes were attempted,
//! with failed writes rolled back, so an aborted cycle leaves the previous
//! table in place and the next snapshot re-derives the same changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulse_feed::FeedClient;
use pulse_state::{
    DisruptionRecord, DisruptionStore, MajorStop, SampleStore, StorageError, StorageResult,
    SuspensionKind, TopologyStore, TransitStore,
};
use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use crate::analyzer::Analyzer;
use crate::clock::Clock;
use crate::config::LearnerConfig;
use crate::error::{CoreError, Result};
use crate::lifecycle::{reconcile, DisruptionTable, Observation, Reconciliation, Transition};
use crate::metrics::METRICS;
use crate::obs;
use crate::reference::{estimates_from_codes, reference_estimates};
use crate::retry::retry_once;
use crate::sampler::{plan_targets, DelaySampler, HeadwayProvider, SamplingPolicy};
use crate::severity::{MergeParams, SeverityModel};

/// Per-cycle error counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleErrors {
    pub feed: u64,
    pub malformed: u64,
    pub identity_ambiguity: u64,
    pub persistence: u64,
    pub sampling: u64,
}

impl CycleErrors {
    pub fn total(&self) -> u64 {
        self.feed + self.malformed + self.identity_ambiguity + self.persistence + self.sampling
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub cycle_index: u64,
    pub started_at: DateTime<Utc>,
    pub created: usize,
    pub updated: usize,
    pub resolved: usize,
    pub unchanged: usize,
    /// Snapshot items whose identity was already resolved
    pub suppressed: usize,
    /// Written records classified partial with no resolvable section
    pub degraded: usize,
    pub samples_taken: usize,
    /// Predictions for lines no active disruption covers
    pub samples_discarded: usize,
    pub estimates_updated: usize,
    pub errors: CycleErrors,
    pub feed_unavailable: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CycleResult {
    fn new(cycle_index: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_index,
            started_at,
            created: 0,
            updated: 0,
            resolved: 0,
            unchanged: 0,
            suppressed: 0,
            degraded: 0,
            samples_taken: 0,
            samples_discarded: 0,
            estimates_updated: 0,
            errors: CycleErrors::default(),
            feed_unavailable: false,
            timed_out: false,
            duration_ms: 0,
        }
    }
}

/// What `initialize` restored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub estimates_seeded: usize,
    pub estimates_loaded: usize,
    pub pending_samples_restored: usize,
    pub active_disruptions: usize,
    pub tombstones: usize,
    pub major_stops: usize,
}

struct CycleState {
    table: DisruptionTable,
    major_stops: Vec<MajorStop>,
}

/// Orchestrates poll cycles over the analyzer, tracker, sampler and model.
pub struct LearningController {
    config: LearnerConfig,
    analyzer: Analyzer,
    policy: SamplingPolicy,
    feed: Arc<dyn FeedClient>,
    disruptions: Arc<dyn DisruptionStore>,
    samples: Arc<dyn SampleStore>,
    topology: Arc<dyn TopologyStore>,
    model: SeverityModel,
    sampler: DelaySampler,
    clock: Arc<dyn Clock>,
    state: tokio::sync::Mutex<CycleState>,
    cycle_index: AtomicU64,
}

impl LearningController {
    pub fn new<S>(
        config: LearnerConfig,
        feed: Arc<dyn FeedClient>,
        store: Arc<S>,
        headways: Arc<dyn HeadwayProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        S: TransitStore + 'static,
    {
        config.validate()?;
        let analyzer = Analyzer::new(&config.keywords)?;
        let model = SeverityModel::new(store.clone(), MergeParams::from(&config));
        let sampler = DelaySampler::new(
            feed.clone(),
            headways,
            config.max_arrivals_per_line,
            config.max_concurrent_stops,
        );

        Ok(Self {
            policy: SamplingPolicy::from(&config),
            analyzer,
            feed,
            disruptions: store.clone(),
            samples: store.clone(),
            topology: store,
            model,
            sampler,
            clock,
            state: tokio::sync::Mutex::new(CycleState {
                table: DisruptionTable::new(),
                major_stops: Vec::new(),
            }),
            cycle_index: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn model(&self) -> &SeverityModel {
        &self.model
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    /// Index of the most recently started cycle (0 before the first).
    pub fn cycle_index(&self) -> u64 {
        self.cycle_index.load(Ordering::SeqCst)
    }

    /// Active disruptions as currently tracked.
    pub async fn active_disruptions(&self) -> Vec<DisruptionRecord> {
        self.state.lock().await.table.active().cloned().collect()
    }

    /// Seed reference estimates, then rebuild in-memory state from storage.
    pub async fn initialize(&self) -> Result<InitReport> {
        let now = self.clock.now();
        let estimates_seeded = self
            .model
            .seed(reference_estimates(
                &self.config.modes,
                self.config.initial_confidence,
                now,
            ))
            .await?;
        let estimates_loaded = self.model.load().await?;
        let pending_samples_restored = self.model.rehydrate_pending(self.samples.as_ref()).await?;

        let active = self.disruptions.list_active().await?;
        let resolved = self
            .disruptions
            .list_resolved_since(now - self.config.tombstone_retention())
            .await?;
        let table = DisruptionTable::rehydrate(active, resolved);
        let major_stops = self.load_major_stops().await?;

        let report = InitReport {
            estimates_seeded,
            estimates_loaded,
            pending_samples_restored,
            active_disruptions: table.len(),
            tombstones: table.tombstone_count(),
            major_stops: major_stops.len(),
        };

        let mut state = self.state.lock().await;
        state.table = table;
        state.major_stops = major_stops;
        info!(?report, "learning controller initialised");
        Ok(report)
    }

    /// Seed estimates from the feed's published severity codes.
    ///
    /// Keys already stored are left alone.
    pub async fn seed_from_feed(&self) -> Result<usize> {
        let codes = self.feed.fetch_severity_codes().await?;
        let seeded = self
            .model
            .seed(estimates_from_codes(
                &codes,
                self.config.initial_confidence,
                self.clock.now(),
            ))
            .await?;
        self.model.load().await?;
        Ok(seeded)
    }

    /// Reload the major stop list from the topology store.
    pub async fn refresh_major_stops(&self) -> Result<usize> {
        let major_stops = self.load_major_stops().await?;
        let count = major_stops.len();
        self.state.lock().await.major_stops = major_stops;
        Ok(count)
    }

    async fn load_major_stops(&self) -> Result<Vec<MajorStop>> {
        let stops = self
            .topology
            .major_stops(self.config.major_stop_threshold, self.config.max_major_stops)
            .await?;
        debug!(count = stops.len(), "major stops loaded");
        Ok(stops)
    }

    /// Run one poll cycle. Never fails: problems are counted in the result.
    pub async fn run_cycle(&self) -> CycleResult {
        let cycle_index = self.cycle_index.fetch_add(1, Ordering::SeqCst) + 1;
        let started = tokio::time::Instant::now();
        let mut result = CycleResult::new(cycle_index, self.clock.now());

        let timeout = self.config.cycle_timeout();
        let body = self.cycle_body(&mut result).instrument(obs::cycle_span(cycle_index));
        if tokio::time::timeout(timeout, body).await.is_err() {
            let err = CoreError::CycleTimeout {
                timeout_secs: self.config.cycle_timeout_secs,
            };
            obs::emit_feed_unavailable(cycle_index, &err);
            METRICS.inc_feed_failures();
            result.timed_out = true;
            result.feed_unavailable = true;
            result.errors.feed += 1;
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        METRICS.inc_cycles();
        METRICS.add_records_written((result.created + result.updated + result.resolved) as u64);
        METRICS.add_samples(result.samples_taken as u64);
        METRICS.add_estimates_updated(result.estimates_updated as u64);
        obs::emit_cycle_finished(&result);
        result
    }

    async fn cycle_body(&self, result: &mut CycleResult) {
        let mut state = self.state.lock().await;
        obs::emit_cycle_started(result.cycle_index, state.table.len());

        let raw = match self.feed.fetch_disruptions(&self.config.modes).await {
            Ok(raw) => raw,
            Err(err) => {
                let err = CoreError::FeedUnavailable(err);
                obs::emit_feed_unavailable(result.cycle_index, &err);
                METRICS.inc_feed_failures();
                result.feed_unavailable = true;
                result.errors.feed += 1;
                return;
            }
        };

        let now = self.clock.now();
        let mut observations = Vec::with_capacity(raw.len());
        for item in &raw {
            match Observation::from_raw(item, &self.analyzer) {
                Ok(observation) => observations.push(observation),
                Err(err) => {
                    warn!(error = %err, line_id = ?item.line_id, "skipping malformed feed item");
                    result.errors.malformed += 1;
                }
            }
        }

        let (mut next, reconciliation) = reconcile(
            &state.table,
            observations,
            now,
            self.config.tombstone_retention(),
        );
        for id in &reconciliation.ambiguities {
            let err = CoreError::IdentityAmbiguity { id: id.to_string() };
            obs::emit_identity_ambiguous(id.as_str(), &err);
            result.errors.identity_ambiguity += 1;
        }
        result.unchanged = reconciliation.unchanged;
        result.suppressed = reconciliation.suppressed.len();

        self.persist(&mut next, reconciliation, result, now).await;
        state.table = next;

        if self.config.learning_enabled {
            self.learn(&state, result, now).await;
        }
    }

    async fn write(&self, record: &DisruptionRecord) -> StorageResult<()> {
        retry_once("upsert disruption", || {
            self.disruptions.upsert_disruption(record)
        })
        .await
    }

    /// Write every change; roll back the table entry of each failed write.
    async fn persist(
        &self,
        table: &mut DisruptionTable,
        reconciliation: Reconciliation,
        result: &mut CycleResult,
        now: DateTime<Utc>,
    ) {
        for record in reconciliation.created {
            match self.write(&record).await {
                Ok(()) => {
                    result.created += 1;
                    obs::emit_disruption_created(&record);
                    result.degraded += report_degraded(&record);
                }
                Err(StorageError::ImmutableRecord { .. }) => {
                    self.adopt_resolved(table, &record, now).await;
                    result.suppressed += 1;
                }
                Err(err) => {
                    self.write_failed(&record, &err, result);
                    table.revert_created(&record.id);
                }
            }
        }

        for Transition { previous, current } in reconciliation.updated {
            match self.write(&current).await {
                Ok(()) => {
                    result.updated += 1;
                    obs::emit_disruption_updated(&current);
                    result.degraded += report_degraded(&current);
                }
                Err(StorageError::ImmutableRecord { .. }) => {
                    self.adopt_resolved(table, &current, now).await;
                    result.suppressed += 1;
                }
                Err(err) => {
                    self.write_failed(&current, &err, result);
                    table.restore(previous);
                }
            }
        }

        for Transition { previous, current } in reconciliation.resolved {
            match self.write(&current).await {
                // Already resolved by an earlier, interrupted cycle.
                Ok(()) | Err(StorageError::ImmutableRecord { .. }) => {
                    result.resolved += 1;
                    obs::emit_disruption_resolved(&current);
                }
                Err(err) => {
                    self.write_failed(&current, &err, result);
                    table.restore(previous);
                }
            }
        }
    }

    /// The store already holds this identity as resolved; track it as such.
    async fn adopt_resolved(
        &self,
        table: &mut DisruptionTable,
        record: &DisruptionRecord,
        now: DateTime<Utc>,
    ) {
        let stored = match self.disruptions.get_disruption(&record.id).await {
            Ok(Some(stored)) => stored,
            _ => record.clone(),
        };
        debug!(disruption_id = %record.id, "identity already resolved in storage");
        table.bury(&stored, now);
    }

    fn write_failed(&self, record: &DisruptionRecord, err: &StorageError, result: &mut CycleResult) {
        warn!(
            disruption_id = %record.id,
            state = record.state.as_str(),
            error = %err,
            "disruption write dropped after retry"
        );
        METRICS.inc_persistence_failures();
        result.errors.persistence += 1;
    }

    async fn learn(&self, state: &CycleState, result: &mut CycleResult, now: DateTime<Utc>) {
        let estimates: BTreeMap<_, _> = self
            .model
            .estimates()
            .await
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        let active: Vec<DisruptionRecord> = state.table.active().cloned().collect();
        let targets = plan_targets(
            &active,
            &estimates,
            &state.major_stops,
            &self.policy,
            result.cycle_index,
            self.config.max_stops_per_cycle,
        );

        if !targets.is_empty() {
            let outcome = self.sampler.sample_all(&targets, now).await;
            result.errors.sampling += outcome.failed_stops.len() as u64;
            result.samples_discarded += outcome.discarded;

            // Buffered before the append: an abandoned cycle must not leave a
            // stored sample missing from its buffer.
            for sample in outcome.samples {
                if !self.model.record(sample.clone()).await {
                    continue;
                }
                let appended =
                    retry_once("append sample", || self.samples.append_sample(&sample)).await;
                match appended {
                    Ok(()) => result.samples_taken += 1,
                    Err(err) => {
                        self.model.discard(&sample.key, &sample.sample_id).await;
                        warn!(stop_id = %sample.stop_id, error = %err, "delay sample dropped");
                        METRICS.inc_persistence_failures();
                        result.errors.persistence += 1;
                    }
                }
            }
        }

        let flushed = self.model.flush_ready(now).await;
        result.estimates_updated = flushed.updates.len();
        for (key, err) in &flushed.failures {
            warn!(key = %key, error = %err, "estimate update deferred");
            METRICS.inc_persistence_failures();
            result.errors.persistence += 1;
        }
    }
}

/// Log a partial suspension whose section could not be resolved.
fn report_degraded(record: &DisruptionRecord) -> usize {
    if record.suspension == SuspensionKind::Partial && record.section.is_none() {
        obs::emit_classification_degraded(record.id.as_str(), &record.line_id);
        1
    } else {
        0
    }
}
