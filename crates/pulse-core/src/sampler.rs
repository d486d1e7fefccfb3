//! Delay sampling at major interchange stops.
//!
//! Per cycle the sampler picks stops that are both major and implicated by
//! an active disruption whose severity context is due, fetches live arrival
//! predictions there, and turns gaps between successive arrivals into
//! excess-delay samples attributed to the disruption driving each line.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use pulse_feed::{AffectedRoute, AffectedStop, ArrivalPrediction, FeedClient};
use pulse_state::{
    DelaySample, DisruptionId, DisruptionRecord, MajorStop, SeverityKey, SeverityLevelEstimate,
};
use tracing::debug;
use uuid::Uuid;

use crate::analyzer::extract_line_ids;
use crate::config::LearnerConfig;
use crate::error::CoreError;
use crate::obs;

/// Source of the expected interval between arrivals.
pub trait HeadwayProvider: Send + Sync {
    /// Expected headway in seconds for `line_id` at `stop_id`.
    fn expected_headway_secs(&self, mode: &str, line_id: &str, stop_id: &str) -> f64;
}

/// Fixed nominal headway per mode.
#[derive(Debug, Clone)]
pub struct NominalHeadways {
    by_mode: BTreeMap<String, f64>,
    fallback_secs: f64,
}

impl NominalHeadways {
    pub fn new(by_mode: BTreeMap<String, f64>, fallback_secs: f64) -> Self {
        Self {
            by_mode,
            fallback_secs,
        }
    }

    pub fn from_config(config: &LearnerConfig) -> Self {
        Self::new(
            config.default_headway_secs.clone(),
            config.fallback_headway_secs,
        )
    }
}

impl HeadwayProvider for NominalHeadways {
    fn expected_headway_secs(&self, mode: &str, _line_id: &str, _stop_id: &str) -> f64 {
        self.by_mode.get(mode).copied().unwrap_or(self.fallback_secs)
    }
}

/// Adaptive per-context sampling cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    pub sample_every_n: u64,
    pub confidence_threshold: f64,
    pub high_confidence_threshold: f64,
}

impl From<&LearnerConfig> for SamplingPolicy {
    fn from(config: &LearnerConfig) -> Self {
        Self {
            sample_every_n: config.sample_every_n,
            confidence_threshold: config.confidence_threshold,
            high_confidence_threshold: config.high_confidence_threshold,
        }
    }
}

impl SamplingPolicy {
    /// Cycles between samples for a context, or `None` once it is trusted.
    pub fn cadence(&self, confidence: f64) -> Option<u64> {
        let n = self.sample_every_n.max(1);
        if confidence > self.high_confidence_threshold {
            None
        } else if confidence > self.confidence_threshold {
            Some(n * 2)
        } else {
            Some(n)
        }
    }

    pub fn is_due(&self, cycle_index: u64, confidence: f64) -> bool {
        self.cadence(confidence)
            .is_some_and(|every| cycle_index % every == 0)
    }
}

/// The severity context a line's samples are credited to.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub key: SeverityKey,
    pub disruption_id: DisruptionId,
    pub estimate_minutes: f64,
}

impl Attribution {
    /// Higher current estimate wins; ties go to the lower disruption id.
    fn outranks(&self, other: &Attribution) -> bool {
        match self.estimate_minutes.total_cmp(&other.estimate_minutes) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.disruption_id < other.disruption_id,
        }
    }
}

/// A stop to sample and the attribution for each line there.
#[derive(Debug, Clone, PartialEq)]
pub struct StopTarget {
    pub stop_id: String,
    pub lines: BTreeMap<String, Attribution>,
}

impl StopTarget {
    pub fn line_ids(&self) -> Vec<String> {
        self.lines.keys().cloned().collect()
    }
}

/// Lines and stops a record implicates, read back from its stored payloads.
fn implicated(record: &DisruptionRecord) -> (BTreeSet<String>, HashSet<String>) {
    let routes: Vec<AffectedRoute> =
        serde_json::from_value(record.affected_routes.clone()).unwrap_or_default();
    let stops: Vec<AffectedStop> =
        serde_json::from_value(record.affected_stops.clone()).unwrap_or_default();

    let mut lines = BTreeSet::from([record.line_id.clone()]);
    lines.extend(extract_line_ids(&routes));

    let mut stop_ids: HashSet<String> = stops.into_iter().map(|s| s.stop_id).collect();
    stop_ids.extend(
        routes
            .iter()
            .flat_map(|r| r.section.iter())
            .filter_map(|e| e.stop_id.clone()),
    );
    if let Some(section) = &record.section {
        stop_ids.insert(section.start.clone());
        stop_ids.insert(section.end.clone());
    }
    (lines, stop_ids)
}

/// Choose the stops to sample this cycle.
///
/// `major_stops` is expected busiest first; at most `max_stops` targets are
/// returned in that order.
pub fn plan_targets(
    active: &[DisruptionRecord],
    estimates: &BTreeMap<SeverityKey, SeverityLevelEstimate>,
    major_stops: &[MajorStop],
    policy: &SamplingPolicy,
    cycle_index: u64,
    max_stops: usize,
) -> Vec<StopTarget> {
    let due: Vec<(Attribution, BTreeSet<String>, HashSet<String>)> = active
        .iter()
        .filter_map(|record| {
            let key = record.severity_key()?;
            let estimate = estimates.get(&key)?;
            if estimate.is_suspension || !policy.is_due(cycle_index, estimate.confidence_score) {
                return None;
            }
            let (lines, stops) = implicated(record);
            Some((
                Attribution {
                    key,
                    disruption_id: record.id.clone(),
                    estimate_minutes: estimate.estimated_delay_minutes,
                },
                lines,
                stops,
            ))
        })
        .collect();

    if due.is_empty() {
        return Vec::new();
    }

    let mut targets = Vec::new();
    for stop in major_stops {
        if targets.len() >= max_stops {
            break;
        }
        let mut lines: BTreeMap<String, Attribution> = BTreeMap::new();
        for (attribution, record_lines, record_stops) in &due {
            if !record_stops.contains(&stop.stop_id) {
                continue;
            }
            for line in record_lines {
                let replace = lines
                    .get(line)
                    .map_or(true, |current| attribution.outranks(current));
                if replace {
                    lines.insert(line.clone(), attribution.clone());
                }
            }
        }
        if !lines.is_empty() {
            targets.push(StopTarget {
                stop_id: stop.stop_id.clone(),
                lines,
            });
        }
    }
    targets
}

/// Turn predictions at one stop into attributed samples.
///
/// Returns the samples and the number of predictions discarded because no
/// active disruption covers their line.
pub fn derive_samples(
    target: &StopTarget,
    predictions: &[ArrivalPrediction],
    headways: &dyn HeadwayProvider,
    max_arrivals_per_line: usize,
    now: DateTime<Utc>,
) -> (Vec<DelaySample>, usize) {
    let mut by_line: BTreeMap<&str, Vec<DateTime<Utc>>> = BTreeMap::new();
    let mut discarded = 0;
    for p in predictions {
        if target.lines.contains_key(&p.line_id) {
            by_line.entry(p.line_id.as_str()).or_default().push(p.expected_arrival);
        } else {
            discarded += 1;
        }
    }

    let mut samples = Vec::new();
    for (line_id, mut arrivals) in by_line {
        let Some(attribution) = target.lines.get(line_id) else {
            continue;
        };
        arrivals.sort();
        arrivals.truncate(max_arrivals_per_line);

        let expected =
            headways.expected_headway_secs(&attribution.key.mode, line_id, &target.stop_id);
        for pair in arrivals.windows(2) {
            let observed = (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0;
            samples.push(DelaySample {
                sample_id: Uuid::new_v4().to_string(),
                stop_id: target.stop_id.clone(),
                line_id: line_id.to_string(),
                sampled_at: now,
                expected_interval_secs: expected,
                observed_interval_secs: observed,
                excess_delay_minutes: (observed - expected).max(0.0) / 60.0,
                key: attribution.key.clone(),
                disruption_id: attribution.disruption_id.clone(),
            });
        }
    }
    (samples, discarded)
}

/// What one sampling pass produced.
#[derive(Debug, Default)]
pub struct SamplingOutcome {
    pub samples: Vec<DelaySample>,
    pub stops_sampled: usize,
    pub failed_stops: Vec<String>,
    pub discarded: usize,
}

/// Fetches arrivals and derives samples, several stops at a time.
pub struct DelaySampler {
    feed: Arc<dyn FeedClient>,
    headways: Arc<dyn HeadwayProvider>,
    max_arrivals_per_line: usize,
    max_concurrent_stops: usize,
}

impl DelaySampler {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        headways: Arc<dyn HeadwayProvider>,
        max_arrivals_per_line: usize,
        max_concurrent_stops: usize,
    ) -> Self {
        Self {
            feed,
            headways,
            max_arrivals_per_line,
            max_concurrent_stops: max_concurrent_stops.max(1),
        }
    }

    /// Sample a single stop.
    pub async fn sample_stop(
        &self,
        target: &StopTarget,
        now: DateTime<Utc>,
    ) -> Result<(Vec<DelaySample>, usize), CoreError> {
        let predictions = self
            .feed
            .fetch_arrivals(&target.line_ids(), &target.stop_id, None)
            .await
            .map_err(|e| CoreError::SamplingFailure {
                stop_id: target.stop_id.clone(),
                reason: e.to_string(),
            })?;
        let (samples, discarded) = derive_samples(
            target,
            &predictions,
            self.headways.as_ref(),
            self.max_arrivals_per_line,
            now,
        );
        debug!(
            stop_id = %target.stop_id,
            predictions = predictions.len(),
            samples = samples.len(),
            "stop sampled"
        );
        Ok((samples, discarded))
    }

    /// Sample every target; a failing stop is skipped without affecting the rest.
    pub async fn sample_all(&self, targets: &[StopTarget], now: DateTime<Utc>) -> SamplingOutcome {
        let futures: Vec<_> = targets
            .iter()
            .map(|target| async move {
                (target.stop_id.clone(), self.sample_stop(target, now).await)
            })
            .collect();
        let results: Vec<(String, Result<(Vec<DelaySample>, usize), CoreError>)> =
            stream::iter(futures)
                .buffer_unordered(self.max_concurrent_stops)
                .collect()
                .await;

        let mut outcome = SamplingOutcome::default();
        for (stop_id, result) in results {
            match result {
                Ok((samples, discarded)) => {
                    outcome.stops_sampled += 1;
                    outcome.discarded += discarded;
                    outcome.samples.extend(samples);
                }
                Err(err) => {
                    obs::emit_stop_sampling_failed(&stop_id, &err);
                    outcome.failed_stops.push(stop_id);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pulse_state::{IdentityBasis, LifecycleState, SuspensionKind};
    use serde_json::json;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn policy() -> SamplingPolicy {
        SamplingPolicy {
            sample_every_n: 10,
            confidence_threshold: 0.75,
            high_confidence_threshold: 0.90,
        }
    }

    fn record(id: &str, line: &str, level: i32, stops: &[&str]) -> DisruptionRecord {
        let affected: Vec<_> = stops.iter().map(|s| json!({"stopId": s, "lines": []})).collect();
        DisruptionRecord {
            id: DisruptionId(id.to_string()),
            identity_basis: IdentityBasis::CreatedTimestamp,
            mode: "tube".into(),
            line_id: line.into(),
            category: "RealTime".into(),
            disruption_type: "lineInfo".into(),
            category_description: None,
            description: "delays".into(),
            summary: None,
            additional_info: None,
            closure_text: None,
            severity_label: None,
            severity_level: Some(level),
            suspension: SuspensionKind::None,
            section: None,
            affected_routes: json!([]),
            affected_stops: json!(affected),
            created: Some(at(0)),
            last_update: Some(at(0)),
            valid_from: None,
            valid_to: None,
            first_seen: at(0),
            last_seen: at(0),
            resolved_at: None,
            state: LifecycleState::New,
        }
    }

    fn estimate(level: i32, minutes: f64, confidence: f64) -> SeverityLevelEstimate {
        SeverityLevelEstimate {
            key: SeverityKey::new("tube", level),
            description: String::new(),
            estimated_delay_minutes: minutes,
            confidence_score: confidence,
            sample_count: 0,
            is_suspension: false,
            last_updated: at(0),
        }
    }

    fn estimates(list: Vec<SeverityLevelEstimate>) -> BTreeMap<SeverityKey, SeverityLevelEstimate> {
        list.into_iter().map(|e| (e.key.clone(), e)).collect()
    }

    fn major(stop: &str, lines: u32) -> MajorStop {
        MajorStop {
            stop_id: stop.into(),
            name: None,
            line_count: lines,
        }
    }

    #[test]
    fn cadence_adapts_to_confidence() {
        let p = policy();
        assert_eq!(p.cadence(0.3), Some(10));
        assert_eq!(p.cadence(0.75), Some(10));
        assert_eq!(p.cadence(0.8), Some(20));
        assert_eq!(p.cadence(0.9), Some(20));
        assert_eq!(p.cadence(0.91), None);

        assert!(p.is_due(10, 0.3));
        assert!(!p.is_due(10, 0.8));
        assert!(p.is_due(20, 0.8));
        assert!(!p.is_due(7, 0.3));
        assert!(!p.is_due(100, 0.95));
    }

    #[test]
    fn only_major_implicated_stops_are_targeted() {
        let active = vec![record("d1", "central", 6, &["OXC", "BNK", "LST"])];
        let est = estimates(vec![estimate(6, 12.0, 0.3)]);
        let stops = vec![major("KGX", 6), major("OXC", 3), major("BNK", 4)];

        let targets = plan_targets(&active, &est, &stops, &policy(), 10, 5);
        let ids: Vec<&str> = targets.iter().map(|t| t.stop_id.as_str()).collect();
        assert_eq!(ids, vec!["OXC", "BNK"]);

        assert!(plan_targets(&active, &est, &stops, &policy(), 11, 5).is_empty());
        assert_eq!(plan_targets(&active, &est, &stops, &policy(), 10, 1).len(), 1);
    }

    #[test]
    fn suspension_and_trusted_contexts_are_skipped() {
        let active = vec![
            record("d1", "central", 6, &["OXC"]),
            record("d2", "victoria", 20, &["OXC"]),
        ];
        let mut closed = estimate(20, 0.0, 0.3);
        closed.is_suspension = true;
        let est = estimates(vec![estimate(6, 12.0, 0.93), closed]);
        assert!(plan_targets(&active, &est, &[major("OXC", 3)], &policy(), 10, 5).is_empty());
    }

    #[test]
    fn highest_estimate_wins_line_attribution() {
        let mut a = record("d-b", "central", 6, &["OXC"]);
        a.affected_routes = json!([{"lineId": "victoria", "section": []}]);
        let b = record("d-a", "victoria", 9, &["OXC"]);
        let est = estimates(vec![estimate(6, 12.0, 0.3), estimate(9, 5.0, 0.3)]);

        let targets = plan_targets(&[a, b], &est, &[major("OXC", 3)], &policy(), 10, 5);
        let target = &targets[0];
        assert_eq!(target.lines["central"].key.level, 6);
        assert_eq!(target.lines["victoria"].key.level, 6);
        assert_eq!(target.lines["victoria"].disruption_id.as_str(), "d-b");

        let tie = Attribution {
            key: SeverityKey::new("tube", 9),
            disruption_id: DisruptionId("d-a".into()),
            estimate_minutes: 12.0,
        };
        assert!(tie.outranks(&target.lines["central"]));
    }

    struct Fixed(f64);

    impl HeadwayProvider for Fixed {
        fn expected_headway_secs(&self, _: &str, _: &str, _: &str) -> f64 {
            self.0
        }
    }

    fn prediction(line: &str, minute: i64) -> ArrivalPrediction {
        ArrivalPrediction {
            line_id: line.into(),
            stop_id: "OXC".into(),
            expected_arrival: at(minute),
            vehicle_id: None,
            platform_name: None,
            direction: None,
        }
    }

    fn target() -> StopTarget {
        StopTarget {
            stop_id: "OXC".into(),
            lines: BTreeMap::from([(
                "central".to_string(),
                Attribution {
                    key: SeverityKey::new("tube", 6),
                    disruption_id: DisruptionId("d1".into()),
                    estimate_minutes: 12.0,
                },
            )]),
        }
    }

    #[test]
    fn intervals_become_excess_delay() {
        let predictions = vec![
            prediction("central", 10),
            prediction("central", 1),
            prediction("central", 4),
            prediction("northern", 2),
        ];
        let (samples, discarded) = derive_samples(&target(), &predictions, &Fixed(180.0), 10, at(0));

        assert_eq!(discarded, 1);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].observed_interval_secs, 180.0);
        assert_eq!(samples[0].excess_delay_minutes, 0.0);
        assert_eq!(samples[1].observed_interval_secs, 360.0);
        assert_eq!(samples[1].excess_delay_minutes, 3.0);
        assert!(samples.iter().all(|s| s.key == SeverityKey::new("tube", 6)));
    }

    #[test]
    fn arrivals_are_capped_per_line() {
        let predictions: Vec<_> = (0..15).map(|m| prediction("central", m * 5)).collect();
        let (samples, _) = derive_samples(&target(), &predictions, &Fixed(180.0), 10, at(0));
        assert_eq!(samples.len(), 9);
        assert!(samples.iter().all(|s| s.excess_delay_minutes == 2.0));
    }

    #[test]
    fn nominal_headways_fall_back() {
        let h = NominalHeadways::from_config(&LearnerConfig::default());
        assert_eq!(h.expected_headway_secs("tube", "central", "OXC"), 180.0);
        assert_eq!(h.expected_headway_secs("tram", "tram", "X"), 300.0);
    }
}
