//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryTransitStore` satisfies every storage trait contract without any
//! external dependencies. Write failures can be injected to exercise the
//! learner's retry and rollback paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory store backed by `HashMap`s behind mutexes.
#[derive(Debug, Default)]
pub struct MemoryTransitStore {
    disruptions: Mutex<HashMap<DisruptionId, DisruptionRecord>>,
    estimates: Mutex<BTreeMap<SeverityKey, SeverityLevelEstimate>>,
    samples: Mutex<Vec<DelaySample>>,
    stop_lines: Mutex<BTreeMap<String, (Option<String>, BTreeSet<String>)>>,
    failing_disruption_writes: AtomicU32,
    failing_estimate_writes: AtomicU32,
    failing_sample_writes: AtomicU32,
    estimate_write_delay_ms: AtomicU64,
    disruption_writes: AtomicU64,
    estimate_writes: AtomicU64,
}

impl MemoryTransitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the lines serving a stop (topology fixture).
    pub fn add_stop(&self, stop_id: &str, name: Option<&str>, lines: &[&str]) {
        let mut stops = self.stop_lines.lock().unwrap();
        let entry = stops
            .entry(stop_id.to_string())
            .or_insert_with(|| (name.map(str::to_string), BTreeSet::new()));
        entry.1.extend(lines.iter().map(|l| l.to_string()));
    }

    /// Fail the next `n` disruption upserts with a backend error.
    pub fn fail_next_disruption_writes(&self, n: u32) {
        self.failing_disruption_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` estimate upserts with a backend error.
    pub fn fail_next_estimate_writes(&self, n: u32) {
        self.failing_estimate_writes.store(n, Ordering::SeqCst);
    }

    /// Stall the next estimate upsert for `delay` before it lands.
    pub fn delay_next_estimate_write(&self, delay: Duration) {
        self.estimate_write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `n` sample appends with a backend error.
    pub fn fail_next_sample_writes(&self, n: u32) {
        self.failing_sample_writes.store(n, Ordering::SeqCst);
    }

    /// Number of successful disruption upserts so far.
    pub fn disruption_writes(&self) -> u64 {
        self.disruption_writes.load(Ordering::SeqCst)
    }

    /// Number of successful estimate upserts so far.
    pub fn estimate_writes(&self) -> u64 {
        self.estimate_writes.load(Ordering::SeqCst)
    }

    /// Every stored sample, in append order.
    pub fn all_samples(&self) -> Vec<DelaySample> {
        self.samples.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DisruptionStore for MemoryTransitStore {
    async fn upsert_disruption(&self, record: &DisruptionRecord) -> StorageResult<()> {
        if Self::take_failure(&self.failing_disruption_writes) {
            return Err(StorageError::Backend("injected disruption write failure".into()));
        }
        let mut disruptions = self.disruptions.lock().unwrap();
        if let Some(existing) = disruptions.get(&record.id) {
            if existing.state.is_terminal() {
                return Err(StorageError::ImmutableRecord {
                    id: record.id.0.clone(),
                });
            }
        }
        disruptions.insert(record.id.clone(), record.clone());
        self.disruption_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_disruption(&self, id: &DisruptionId) -> StorageResult<Option<DisruptionRecord>> {
        let disruptions = self.disruptions.lock().unwrap();
        Ok(disruptions.get(id).cloned())
    }

    async fn list_active(&self) -> StorageResult<Vec<DisruptionRecord>> {
        let disruptions = self.disruptions.lock().unwrap();
        let mut active: Vec<DisruptionRecord> = disruptions
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn list_resolved_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<DisruptionRecord>> {
        let disruptions = self.disruptions.lock().unwrap();
        let mut resolved: Vec<DisruptionRecord> = disruptions
            .values()
            .filter(|r| r.resolved_at.is_some_and(|at| at >= since))
            .cloned()
            .collect();
        resolved.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
        Ok(resolved)
    }
}

#[async_trait]
impl SeverityStore for MemoryTransitStore {
    async fn get_estimate(&self, key: &SeverityKey) -> StorageResult<Option<SeverityLevelEstimate>> {
        let estimates = self.estimates.lock().unwrap();
        Ok(estimates.get(key).cloned())
    }

    async fn upsert_estimate(&self, estimate: &SeverityLevelEstimate) -> StorageResult<()> {
        if Self::take_failure(&self.failing_estimate_writes) {
            return Err(StorageError::Backend("injected estimate write failure".into()));
        }
        let delay = self.estimate_write_delay_ms.swap(0, Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut estimates = self.estimates.lock().unwrap();
        estimates.insert(estimate.key.clone(), estimate.clone());
        self.estimate_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_estimates(&self) -> StorageResult<Vec<SeverityLevelEstimate>> {
        let estimates = self.estimates.lock().unwrap();
        Ok(estimates.values().cloned().collect())
    }
}

#[async_trait]
impl SampleStore for MemoryTransitStore {
    async fn append_sample(&self, sample: &DelaySample) -> StorageResult<()> {
        if Self::take_failure(&self.failing_sample_writes) {
            return Err(StorageError::Backend("injected sample write failure".into()));
        }
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }

    async fn samples_since(
        &self,
        key: &SeverityKey,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<DelaySample>> {
        let samples = self.samples.lock().unwrap();
        let mut matching: Vec<DelaySample> = samples
            .iter()
            .filter(|s| &s.key == key)
            .filter(|s| since.map_or(true, |t| s.sampled_at > t))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.sampled_at);
        Ok(matching)
    }
}

#[async_trait]
impl TopologyStore for MemoryTransitStore {
    async fn major_stops(&self, min_lines: u32, limit: usize) -> StorageResult<Vec<MajorStop>> {
        let stops = self.stop_lines.lock().unwrap();
        let mut major: Vec<MajorStop> = stops
            .iter()
            .map(|(stop_id, (name, lines))| MajorStop {
                stop_id: stop_id.clone(),
                name: name.clone(),
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
