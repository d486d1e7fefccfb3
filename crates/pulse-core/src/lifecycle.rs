//! Disruption lifecycle tracking.
//!
//! [`DisruptionTable`] is the keyed set of known disruptions. [`reconcile`]
//! diffs a classified snapshot against it and returns the next table plus
//! the transitions that must be persisted; it performs no I/O.
//!
//! State machine: `New -> (Active | Updated)* -> Resolved`. Resolved identities are kept as tombstones so they cannot re-enter under
//! the same id; a tombstone expires only after the feed has stopped
//! reporting its identity for the whole retention window.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use pulse_feed::RawDisruption;
use pulse_state::{
    DisruptionId, DisruptionRecord, IdentityBasis, LifecycleState, SectionBounds, SuspensionKind,
};
use tracing::{debug, warn};

use crate::analyzer::{Analyzer, Classification};
use crate::error::CoreError;
use crate::identity::{derive_identity, IdentityParts};

const UNKNOWN: &str = "Unknown";

/// A validated, classified snapshot item ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
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
    pub severity_label: Option<String>,
    pub severity_level: Option<i32>,
    pub classification: Classification,
    pub affected_routes: serde_json::Value,
    pub affected_stops: serde_json::Value,
    pub created: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl Observation {
    /// Validate and classify a raw feed item.
    ///
    /// `line_id`, `mode` and a non-blank `description` are required;
    /// category and type default to `"Unknown"`.
    pub fn from_raw(raw: &RawDisruption, analyzer: &Analyzer) -> Result<Self, CoreError> {
        let line_id = required(raw.line_id.as_deref(), "line_id")?;
        let mode = required(raw.mode.as_deref(), "mode")?;
        let description = required(raw.description.as_deref(), "description")?;
        let category = raw.category.clone().unwrap_or_else(|| UNKNOWN.to_string());
        let disruption_type = raw
            .disruption_type
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string());

        let (id, identity_basis) = derive_identity(&IdentityParts {
            line_id,
            category: &category,
            disruption_type: &disruption_type,
            created: raw.created,
            description,
        });

        Ok(Self {
            id,
            identity_basis,
            mode: mode.to_string(),
            line_id: line_id.to_string(),
            category,
            disruption_type,
            category_description: raw.category_description.clone(),
            description: description.to_string(),
            summary: raw.summary.clone(),
            additional_info: raw.additional_info.clone(),
            closure_text: raw.closure_text.clone(),
            severity_label: raw.severity_label.clone(),
            severity_level: raw.severity_level,
            classification: analyzer.analyze(raw),
            affected_routes: serde_json::to_value(&raw.affected_routes)
                .unwrap_or(serde_json::Value::Null),
            affected_stops: serde_json::to_value(&raw.affected_stops)
                .unwrap_or(serde_json::Value::Null),
            created: raw.created,
            last_update: raw.last_update,
            valid_from: raw.valid_from,
            valid_to: raw.valid_to,
        })
    }

    fn into_record(self, now: DateTime<Utc>) -> DisruptionRecord {
        let (suspension, section) = self.split_classification();
        DisruptionRecord {
            id: self.id,
            identity_basis: self.identity_basis,
            mode: self.mode,
            line_id: self.line_id,
            category: self.category,
            disruption_type: self.disruption_type,
            category_description: self.category_description,
            description: self.description,
            summary: self.summary,
            additional_info: self.additional_info,
            closure_text: self.closure_text,
            severity_label: self.severity_label,
            severity_level: self.severity_level,
            suspension,
            section,
            affected_routes: self.affected_routes,
            affected_stops: self.affected_stops,
            created: self.created,
            last_update: self.last_update,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            first_seen: now,
            last_seen: now,
            resolved_at: None,
            state: LifecycleState::New,
        }
    }

    /// Overwrite the mutable fields of `record`; identity and first-seen stay.
    fn apply_to(self, record: &mut DisruptionRecord, now: DateTime<Utc>) {
        let (suspension, section) = self.split_classification();
        record.category_description = self.category_description;
        record.description = self.description;
        record.summary = self.summary;
        record.additional_info = self.additional_info;
        record.closure_text = self.closure_text;
        record.severity_label = self.severity_label;
        record.severity_level = self.severity_level;
        record.suspension = suspension;
        record.section = section;
        record.affected_routes = self.affected_routes;
        record.affected_stops = self.affected_stops;
        record.last_update = self.last_update;
        record.valid_from = self.valid_from;
        record.valid_to = self.valid_to;
        record.last_seen = now;
    }

    fn split_classification(&self) -> (SuspensionKind, Option<SectionBounds>) {
        (
            self.classification.kind,
            self.classification.section.clone(),
        )
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, CoreError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CoreError::MalformedRecord { field }),
    }
}

/// Known disruptions keyed by identity, plus recently resolved tombstones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisruptionTable {
    records: BTreeMap<DisruptionId, DisruptionRecord>,
    tombstones: BTreeMap<DisruptionId, DateTime<Utc>>,
}

impl DisruptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted active records and resolved tombstones.
    ///
    /// Records surviving a restart are promoted from `New` to `Active`.
    pub fn rehydrate(active: Vec<DisruptionRecord>, resolved: Vec<DisruptionRecord>) -> Self {
        let mut table = Self::new();
        for mut record in active {
            if record.state == LifecycleState::New {
                record.state = LifecycleState::Active;
            }
            table.records.insert(record.id.clone(), record);
        }
        for record in resolved {
            let at = record.resolved_at.unwrap_or(record.last_seen);
            table.records.remove(&record.id);
            table.tombstones.insert(record.id, at);
        }
        table
    }

    pub fn get(&self, id: &DisruptionId) -> Option<&DisruptionRecord> {
        self.records.get(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &DisruptionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_tombstoned(&self, id: &DisruptionId) -> bool {
        self.tombstones.contains_key(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Undo a creation whose write failed.
    pub fn revert_created(&mut self, id: &DisruptionId) {
        self.records.remove(id);
    }

    /// Undo an update or resolution whose write failed.
    pub fn restore(&mut self, previous: DisruptionRecord) {
        self.tombstones.remove(&previous.id);
        self.records.insert(previous.id.clone(), previous);
    }

    /// Adopt a record the store already holds as resolved, as last
    /// reported at `seen`.
    pub fn bury(&mut self, record: &DisruptionRecord, seen: DateTime<Utc>) {
        self.records.remove(&record.id);
        let at = record.resolved_at.unwrap_or(record.last_seen).max(seen);
        self.tombstones.insert(record.id.clone(), at);
    }

    /// Refresh a tombstone the feed still reports; `false` if there is none.
    fn touch_tombstone(&mut self, id: &DisruptionId, now: DateTime<Utc>) -> bool {
        match self.tombstones.get_mut(id) {
            Some(at) => {
                *at = (*at).max(now);
                true
            }
            None => false,
        }
    }

    fn prune_tombstones(&mut self, cutoff: DateTime<Utc>) {
        self.tombstones.retain(|_, at| *at >= cutoff);
    }
}

/// A record before and after a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub previous: DisruptionRecord,
    pub current: DisruptionRecord,
}

/// What a reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub created: Vec<DisruptionRecord>,
    pub updated: Vec<Transition>,
    pub resolved: Vec<Transition>,
    pub unchanged: usize,
    /// Text-hash identities matched by more than one snapshot item
    pub ambiguities: Vec<DisruptionId>,
    /// Snapshot items whose identity was already resolved
    pub suppressed: Vec<DisruptionId>,
    /// Repeated timestamp-keyed items in one snapshot
    pub duplicates: usize,
}

impl Reconciliation {
    /// Number of records that must be written.
    pub fn write_count(&self) -> usize {
        self.created.len() + self.updated.len() + self.resolved.len()
    }

    pub fn is_quiet(&self) -> bool {
        self.write_count() == 0
    }
}

enum Change {
    Created,
    Updated(DisruptionRecord),
}

/// Diff `snapshot` against `table` at time `now`.
///
/// Returns the next table and the changes to persist. Calling it again with
/// the returned table and the same snapshot yields no changes.
pub fn reconcile(
    table: &DisruptionTable,
    snapshot: Vec<Observation>,
    now: DateTime<Utc>,
    retention: Duration,
) -> (DisruptionTable, Reconciliation) {
    let mut next = table.clone();
    let mut out = Reconciliation::default();
    let mut changes: BTreeMap<DisruptionId, Change> = BTreeMap::new();
    let mut seen: BTreeSet<DisruptionId> = BTreeSet::new();

    for obs in snapshot {
        let id = obs.id.clone();

        if next.touch_tombstone(&id, now) {
            debug!(disruption_id = %id, "resolved identity reappeared; ignoring");
            out.suppressed.push(id);
            continue;
        }

        if !seen.insert(id.clone()) {
            if obs.identity_basis == IdentityBasis::TextHash {
                warn!(disruption_id = %id, "text-hash identity matched twice in one snapshot");
                out.ambiguities.push(id.clone());
            } else {
                out.duplicates += 1;
                continue;
            }
        }

        match next.records.get_mut(&id) {
            None => {
                next.records.insert(id.clone(), obs.into_record(now));
                changes.insert(id, Change::Created);
            }
            Some(existing) if existing.last_update != obs.last_update => {
                let previous = existing.clone();
                obs.apply_to(existing, now);
                match changes.get(&id) {
                    Some(Change::Created) => {}
                    Some(Change::Updated(_)) => existing.state = LifecycleState::Updated,
                    None => {
                        existing.state = LifecycleState::Updated;
                        changes.insert(id, Change::Updated(previous));
                    }
                }
            }
            Some(_) => {
                if !changes.contains_key(&id) {
                    out.unchanged += 1;
                }
            }
        }
    }

    let gone: Vec<DisruptionId> = next
        .records
        .keys()
        .filter(|id| !seen.contains(*id))
        .cloned()
        .collect();
    for id in gone {
        if let Some(previous) = next.records.remove(&id) {
            let mut current = previous.clone();
            current.state = LifecycleState::Resolved;
            current.resolved_at = Some(now);
            next.tombstones.insert(id, now);
            out.resolved.push(Transition { previous, current });
        }
    }
    next.prune_tombstones(now - retention);

    for (id, change) in changes {
        let Some(current) = next.records.get(&id).cloned() else {
            continue;
        };
        match change {
            Change::Created => out.created.push(current),
            Change::Updated(previous) => out.updated.push(Transition { previous, current }),
        }
    }

    (next, out)
}
