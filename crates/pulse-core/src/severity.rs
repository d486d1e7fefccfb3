//! Severity model store.
//!
//! Holds one slot per (mode, level): the current estimate plus the samples
//! buffered since its last merge. Each slot sits behind its own async mutex,
//! so writers to one key are serialised while different keys proceed
//! independently. Merges happen per batch, never per sample.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use pulse_state::{
    DelaySample, SampleStore, SeverityKey, SeverityLevelEstimate, SeverityStore, StorageError,
};
use tracing::{debug, info};

use crate::config::LearnerConfig;
use crate::error::{CoreError, Result};
use crate::obs;
use crate::retry::retry_once;

/// Upper bound on any confidence score.
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Merge tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeParams {
    pub growth_factor: f64,
    pub prior_pseudo_samples: f64,
    pub min_samples_for_update: usize,
}

impl From<&LearnerConfig> for MergeParams {
    fn from(config: &LearnerConfig) -> Self {
        Self {
            growth_factor: config.growth_factor,
            prior_pseudo_samples: config.prior_pseudo_samples,
            min_samples_for_update: config.min_samples_for_update,
        }
    }
}

/// Effective weight of an existing estimate.
///
/// Grows with both confidence and accumulated samples, so a well-observed
/// estimate resists being pulled by a small batch.
pub fn prior_weight(confidence: f64, sample_count: u64, prior_pseudo_samples: f64) -> f64 {
    confidence * (prior_pseudo_samples + sample_count as f64)
}

pub fn weighted_merge(old: f64, old_weight: f64, sample_mean: f64, batch_size: usize) -> f64 {
    let n = batch_size as f64;
    let total = old_weight + n;
    if total <= 0.0 {
        return sample_mean;
    }
    (old * old_weight + sample_mean * n) / total
}

/// Next confidence: never lower than `old`, never above [`MAX_CONFIDENCE`].
pub fn grow_confidence(old: f64, growth_factor: f64) -> f64 {
    let grown = (old + growth_factor * (1.0 - old)).min(MAX_CONFIDENCE);
    grown.max(old)
}

/// Apply one batch to an estimate.
pub fn merge_batch(
    estimate: &SeverityLevelEstimate,
    batch: &[DelaySample],
    params: &MergeParams,
    now: DateTime<Utc>,
) -> SeverityLevelEstimate {
    let mean = batch.iter().map(|s| s.excess_delay_minutes).sum::<f64>() / batch.len() as f64;
    let weight = prior_weight(
        estimate.confidence_score,
        estimate.sample_count,
        params.prior_pseudo_samples,
    );

    let mut next = estimate.clone();
    next.estimated_delay_minutes =
        weighted_merge(estimate.estimated_delay_minutes, weight, mean, batch.len()).max(0.0);
    next.confidence_score = grow_confidence(estimate.confidence_score, params.growth_factor);
    next.sample_count = estimate.sample_count + batch.len() as u64;
    next.last_updated = now.max(estimate.last_updated);
    next
}

/// An applied merge.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateUpdate {
    pub before: SeverityLevelEstimate,
    pub after: SeverityLevelEstimate,
    pub batch_size: usize,
}

/// Result of flushing every ready buffer.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub updates: Vec<EstimateUpdate>,
    pub failures: Vec<(SeverityKey, StorageError)>,
}

struct Slot {
    estimate: SeverityLevelEstimate,
    pending: Vec<DelaySample>,
}

type SlotRef = Arc<tokio::sync::Mutex<Slot>>;

/// Exclusive owner of severity estimate mutation.
pub struct SeverityModel {
    store: Arc<dyn SeverityStore>,
    params: MergeParams,
    slots: Mutex<BTreeMap<SeverityKey, SlotRef>>,
}

impl SeverityModel {
    pub fn new(store: Arc<dyn SeverityStore>, params: MergeParams) -> Self {
        Self {
            store,
            params,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn params(&self) -> &MergeParams {
        &self.params
    }

    /// Persist estimates for keys the store does not hold yet.
    ///
    /// Existing estimates are never overwritten. Returns the number inserted.
    pub async fn seed(&self, estimates: Vec<SeverityLevelEstimate>) -> Result<usize> {
        let mut inserted = 0;
        for estimate in estimates {
            if self.store.get_estimate(&estimate.key).await?.is_some() {
                continue;
            }
            retry_once("seed estimate", || self.store.upsert_estimate(&estimate)).await?;
            inserted += 1;
        }
        if inserted > 0 {
            info!(inserted, "severity estimates seeded");
        }
        Ok(inserted)
    }

    /// Load every stored estimate into memory, dropping buffered samples.
    pub async fn load(&self) -> Result<usize> {
        let estimates = self.store.list_estimates().await?;
        let count = estimates.len();
        let mut slots = self.lock_slots();
        slots.clear();
        for estimate in estimates {
            slots.insert(
                estimate.key.clone(),
                Arc::new(tokio::sync::Mutex::new(Slot {
                    estimate,
                    pending: Vec::new(),
                })),
            );
        }
        debug!(count, "severity estimates loaded");
        Ok(count)
    }

    /// Refill pending buffers from samples stored after each estimate's
    /// last merge.
    pub async fn rehydrate_pending(&self, samples: &dyn SampleStore) -> Result<usize> {
        let mut restored = 0;
        for slot in self.all_slots() {
            let mut slot = slot.lock().await;
            if slot.estimate.is_suspension {
                continue;
            }
            let since = Some(slot.estimate.last_updated);
            slot.pending = samples.samples_since(&slot.estimate.key, since).await?;
            restored += slot.pending.len();
        }
        if restored > 0 {
            info!(restored, "pending delay samples restored");
        }
        Ok(restored)
    }

    pub async fn get(&self, key: &SeverityKey) -> Result<SeverityLevelEstimate> {
        let slot = self
            .slot(key)
            .ok_or_else(|| CoreError::NotFound(key.clone()))?;
        let slot = slot.lock().await;
        Ok(slot.estimate.clone())
    }

    /// All estimates, ordered by key.
    pub async fn estimates(&self) -> Vec<SeverityLevelEstimate> {
        let mut out = Vec::new();
        for slot in self.all_slots() {
            out.push(slot.lock().await.estimate.clone());
        }
        out
    }

    pub async fn pending_len(&self, key: &SeverityKey) -> usize {
        match self.slot(key) {
            Some(slot) => slot.lock().await.pending.len(),
            None => 0,
        }
    }

    /// Buffer a sample for its key.
    ///
    /// Returns `false` (and drops the sample) when the key is unknown or is
    /// a suspension level.
    pub async fn record(&self, sample: DelaySample) -> bool {
        let Some(slot) = self.slot(&sample.key) else {
            debug!(key = %sample.key, "sample for unknown severity key dropped");
            return false;
        };
        let mut slot = slot.lock().await;
        if slot.estimate.is_suspension {
            return false;
        }
        slot.pending.push(sample);
        true
    }

    /// Drop a buffered sample that never reached storage.
    pub async fn discard(&self, key: &SeverityKey, sample_id: &str) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let mut slot = slot.lock().await;
        let before = slot.pending.len();
        slot.pending.retain(|s| s.sample_id != sample_id);
        slot.pending.len() < before
    }

    /// Merge every buffer holding at least `min_samples_for_update` samples.
    ///
    /// A buffer is drained only once its merged estimate is stored, so a
    /// failed or abandoned write leaves estimate and buffer untouched.
    pub async fn flush_ready(&self, now: DateTime<Utc>) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        for slot in self.all_slots() {
            let mut guard = slot.lock().await;
            let slot = &mut *guard;
            let batch_len = slot.pending.len();
            if batch_len < self.params.min_samples_for_update {
                continue;
            }
            match self.apply(&mut slot.estimate, &slot.pending, now).await {
                Ok(update) => {
                    slot.pending.drain(..batch_len);
                    outcome.updates.extend(update);
                }
                Err(err) => outcome.failures.push((slot.estimate.key.clone(), err)),
            }
        }
        outcome
    }

    /// Merge `batch` into the estimate for `key` immediately.
    ///
    /// Returns `None` for an empty batch or a suspension level.
    pub async fn update(
        &self,
        key: &SeverityKey,
        batch: &[DelaySample],
        now: DateTime<Utc>,
    ) -> Result<Option<EstimateUpdate>> {
        let slot = self
            .slot(key)
            .ok_or_else(|| CoreError::NotFound(key.clone()))?;
        let mut slot = slot.lock().await;
        self.apply(&mut slot.estimate, batch, now)
            .await
            .map_err(CoreError::from)
    }

    /// The in-memory estimate changes only after the store accepted `after`.
    async fn apply(
        &self,
        estimate: &mut SeverityLevelEstimate,
        batch: &[DelaySample],
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<EstimateUpdate>, StorageError> {
        if batch.is_empty() || estimate.is_suspension {
            return Ok(None);
        }
        let after = merge_batch(estimate, batch, &self.params, now);
        retry_once("upsert estimate", || self.store.upsert_estimate(&after)).await?;

        let before = std::mem::replace(estimate, after.clone());
        obs::emit_estimate_updated(&before, &after);
        Ok(Some(EstimateUpdate {
            before,
            after,
            batch_size: batch.len(),
        }))
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, BTreeMap<SeverityKey, SlotRef>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, key: &SeverityKey) -> Option<SlotRef> {
        self.lock_slots().get(key).cloned()
    }

    fn all_slots(&self) -> Vec<SlotRef> {
        self.lock_slots().values().cloned().collect()
    }
}
