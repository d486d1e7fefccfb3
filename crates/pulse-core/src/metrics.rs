//! Process-wide learner counters.
//!
//! Counters are incremented at the call site; [`Metrics::flush`] emits
//! the current values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cycles_run: AtomicU64,
    feed_failures: AtomicU64,
    records_written: AtomicU64,
    samples_taken: AtomicU64,
    estimates_updated: AtomicU64,
    persistence_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            feed_failures: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            samples_taken: AtomicU64::new(0),
            estimates_updated: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_cycles(&self) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_feed_failures(&self) {
        self.feed_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "feed_failures", "counter incremented");
    }

    pub fn add_records_written(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_samples(&self, n: u64) {
        self.samples_taken.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_estimates_updated(&self, n: u64) {
        self.estimates_updated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_persistence_failures(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "persistence_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cycles_run = self.cycles_run(),
            feed_failures = self.feed_failures(),
            records_written = self.records_written(),
            samples_taken = self.samples_taken(),
            estimates_updated = self.estimates_updated(),
            persistence_failures = self.persistence_failures(),
        );
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    pub fn feed_failures(&self) -> u64 {
        self.feed_failures.load(Ordering::Relaxed)
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken.load(Ordering::Relaxed)
    }

    pub fn estimates_updated(&self) -> u64 {
        self.estimates_updated.load(Ordering::Relaxed)
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.cycles_run.store(0, Ordering::Relaxed);
        self.feed_failures.store(0, Ordering::Relaxed);
        self.records_written.store(0, Ordering::Relaxed);
        self.samples_taken.store(0, Ordering::Relaxed);
        self.estimates_updated.store(0, Ordering::Relaxed);
        self.persistence_failures.store(0, Ordering::Relaxed);
    }
}
