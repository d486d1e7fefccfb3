//! Disruption classification.
//!
//! Pure functions over feed text: decide whether a disruption suspends
//! service fully, partially or not at all, and find the boundaries of a
//! partially suspended section.

use std::collections::BTreeSet;

use pulse_feed::{AffectedRoute, RawDisruption, SectionEntry};
use pulse_state::{SectionBounds, SuspensionKind};
use regex::Regex;

use crate::config::KeywordConfig;
use crate::error::ConfigError;

/// Outcome of classifying one disruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: SuspensionKind,
    pub section: Option<SectionBounds>,
}

impl Classification {
    /// A partial suspension whose section could not be resolved.
    pub fn is_degraded(&self) -> bool {
        self.kind == SuspensionKind::Partial && self.section.is_none()
    }
}

/// Keyword classifier compiled from a [`KeywordConfig`].
#[derive(Debug, Clone)]
pub struct Analyzer {
    suspension: Regex,
    partial: Regex,
}

impl Analyzer {
    pub fn new(keywords: &KeywordConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            suspension: marker_regex(&keywords.suspension)?,
            partial: marker_regex(&keywords.partial)?,
        })
    }

    /// Classify free text plus an optional section sequence.
    ///
    /// A partial marker wins over a suspension marker. Boundaries are only
    /// attached to partial suspensions.
    pub fn classify(
        &self,
        description: &str,
        closure_text: Option<&str>,
        section: &[SectionEntry],
    ) -> Classification {
        let text = match closure_text {
            Some(closure) => format!("{description} {closure}"),
            None => description.to_string(),
        };
        self.classify_text(&text, section)
    }

    /// Classify a raw feed item using description, summary and closure text
    /// and the first route that carries a section sequence.
    pub fn analyze(&self, raw: &RawDisruption) -> Classification {
        let text = [
            raw.description.as_deref(),
            raw.summary.as_deref(),
            raw.closure_text.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
        self.classify_text(&text, first_section(&raw.affected_routes))
    }

    fn classify_text(&self, text: &str, section: &[SectionEntry]) -> Classification {
        let kind = if self.partial.is_match(text) {
            SuspensionKind::Partial
        } else if self.suspension.is_match(text) {
            SuspensionKind::Full
        } else {
            SuspensionKind::None
        };

        let section = match kind {
            SuspensionKind::Partial => section_bounds(section),
            _ => None,
        };
        Classification { kind, section }
    }
}

fn marker_regex(markers: &[String]) -> Result<Regex, ConfigError> {
    let alternatives = markers
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(|m| {
            m.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect::<Vec<_>>();
    if alternatives.is_empty() {
        return Err(ConfigError::Invalid("empty marker list".into()));
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
        .map_err(|e| ConfigError::Invalid(format!("bad marker: {e}")))
}

/// The first route with a non-empty section sequence, if any.
pub fn first_section(routes: &[AffectedRoute]) -> &[SectionEntry] {
    routes
        .iter()
        .map(|r| r.section.as_slice())
        .find(|s| !s.is_empty())
        .unwrap_or(&[])
}

/// First and last stop by ordinal; entries without a stop id are ignored.
pub fn section_bounds(section: &[SectionEntry]) -> Option<SectionBounds> {
    let mut stops: Vec<(i32, &str)> = section
        .iter()
        .filter_map(|e| e.stop_id.as_deref().map(|id| (e.ordinal, id)))
        .collect();
    stops.sort_by_key(|(ordinal, _)| *ordinal);

    let (_, start) = stops.first()?;
    let (_, end) = stops.last()?;
    Some(SectionBounds {
        start: start.to_string(),
        end: end.to_string(),
    })
}

/// Distinct line ids referenced by affected routes, sorted.
pub fn extract_line_ids(routes: &[AffectedRoute]) -> Vec<String> {
    routes
        .iter()
        .filter_map(|r| r.line_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
