//! Structured observability hooks for the poll cycle.
//!
//! Every learner event goes through an `emit_*` function so field names stay
//! consistent across call sites. Events carry an `event = "..."` field that
//! log pipelines can filter on.

use pulse_state::{DisruptionRecord, SeverityLevelEstimate};
use tracing::{info, warn};

use crate::controller::CycleResult;

/// Span covering one poll cycle.
///
/// Attach it with `tracing::Instrument` rather than entering it, since the
/// cycle future moves between worker threads.
pub fn cycle_span(cycle_index: u64) -> tracing::Span {
    tracing::info_span!("pulse.cycle", cycle_index = cycle_index)
}

pub fn emit_cycle_started(cycle_index: u64, known: usize) {
    info!(event = "cycle.started", cycle_index, known);
}

pub fn emit_cycle_finished(result: &CycleResult) {
    info!(
        event = "cycle.finished",
        cycle_index = result.cycle_index,
        created = result.created,
        updated = result.updated,
        resolved = result.resolved,
        unchanged = result.unchanged,
        degraded = result.degraded,
        samples_taken = result.samples_taken,
        estimates_updated = result.estimates_updated,
        errors = result.errors.total(),
        feed_unavailable = result.feed_unavailable,
        timed_out = result.timed_out,
        duration_ms = result.duration_ms,
    );
}

/// The feed could not be read (or the cycle timed out); the cycle was skipped.
pub fn emit_feed_unavailable(cycle_index: u64, error: &dyn std::fmt::Display) {
    warn!(event = "cycle.feed_unavailable", cycle_index, error = %error);
}

pub fn emit_disruption_created(record: &DisruptionRecord) {
    info!(
        event = "disruption.created",
        disruption_id = %record.id,
        line_id = %record.line_id,
        suspension = record.suspension.as_str(),
        severity_level = record.severity_level,
    );
}

pub fn emit_disruption_updated(record: &DisruptionRecord) {
    info!(
        event = "disruption.updated",
        disruption_id = %record.id,
        line_id = %record.line_id,
        suspension = record.suspension.as_str(),
    );
}

pub fn emit_disruption_resolved(record: &DisruptionRecord) {
    info!(
        event = "disruption.resolved",
        disruption_id = %record.id,
        line_id = %record.line_id,
    );
}

/// A partial suspension whose section boundaries could not be resolved.
pub fn emit_classification_degraded(disruption_id: &str, line_id: &str) {
    warn!(event = "classification.degraded", disruption_id, line_id);
}

/// Applied as an update to the existing record.
pub fn emit_identity_ambiguous(disruption_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "identity.ambiguous", disruption_id, error = %error);
}

pub fn emit_estimate_updated(before: &SeverityLevelEstimate, after: &SeverityLevelEstimate) {
    info!(
        event = "estimate.updated",
        key = %after.key,
        delay_before = before.estimated_delay_minutes,
        delay_after = after.estimated_delay_minutes,
        confidence = after.confidence_score,
        sample_count = after.sample_count,
    );
}

pub fn emit_stop_sampling_failed(stop_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "sampling.stop_failed", stop_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_span_enters() {
        let _entered = cycle_span(3).entered();
        emit_cycle_started(3, 0);
        emit_feed_unavailable(3, &"timeout");
    }
}
