//! Fixed-interval poll loop.
//!
//! Cycles never overlap: a tick that arrives while a cycle is still running
//! is delayed, not queued. Shutdown is observed between cycles, so an
//! in-flight cycle always finishes its writes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::controller::{CycleResult, LearningController};
use crate::metrics::METRICS;

/// Handle to a running poll loop.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    results: watch::Receiver<Option<CycleResult>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Result of the most recently finished cycle.
    pub fn latest(&self) -> Option<CycleResult> {
        self.results.borrow().clone()
    }

    /// Receiver that changes after every finished cycle.
    pub fn subscribe(&self) -> watch::Receiver<Option<CycleResult>> {
        self.results.clone()
    }

    /// Ask the loop to stop and wait for the in-flight cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "poll loop task ended abnormally");
        }
    }
}

impl LearningController {
    /// Run cycles every `poll_interval` until stopped. The first cycle runs
    /// immediately.
    pub fn start(self: Arc<Self>, poll_interval: Duration) -> MonitorHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let (results_tx, results) = watch::channel(None);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = poll_interval.as_secs(), "poll loop started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let result = self.run_cycle().await;
                        let _ = results_tx.send(Some(result));
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            METRICS.flush();
            info!(cycles = self.cycle_index(), "poll loop stopped");
        });

        MonitorHandle {
            shutdown,
            results,
            task,
        }
    }
}
