//! Disruption identity derivation.
//!
//! The primary key hashes line, category, type and the upstream creation
//! timestamp. When the feed omits the creation timestamp the key falls back
//! to a hash of the normalised description; those ids carry a `t` marker so
//! the two paths never collide.

use chrono::{DateTime, SecondsFormat, Utc};
use pulse_state::{DisruptionId, IdentityBasis};
use sha2::{Digest, Sha256};

/// Inputs to identity derivation, borrowed from a feed item.
#[derive(Debug, Clone, Copy)]
pub struct IdentityParts<'a> {
    pub line_id: &'a str,
    pub category: &'a str,
    pub disruption_type: &'a str,
    pub created: Option<DateTime<Utc>>,
    pub description: &'a str,
}

pub fn derive_identity(parts: &IdentityParts<'_>) -> (DisruptionId, IdentityBasis) {
    let prefix = category_prefix(parts.category);
    match parts.created {
        Some(created) => {
            let digest = digest(&[
                parts.line_id,
                parts.category,
                parts.disruption_type,
                &created.to_rfc3339_opts(SecondsFormat::Secs, true),
            ]);
            (
                DisruptionId(format!("disr-{prefix}-{digest}")),
                IdentityBasis::CreatedTimestamp,
            )
        }
        None => {
            let digest = digest(&[
                parts.line_id,
                parts.category,
                parts.disruption_type,
                &normalize_text(parts.description),
            ]);
            (
                DisruptionId(format!("disr-{prefix}-t{digest}")),
                IdentityBasis::TextHash,
            )
        }
    }
}

/// Lowercase, with runs of whitespace collapsed to one space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn category_prefix(category: &str) -> String {
    let prefix: String = category
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_ascii_lowercase();
    if prefix.is_empty() {
        "unkn".to_string()
    } else {
        prefix
    }
}

fn digest(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parts(created: Option<DateTime<Utc>>, description: &'static str) -> IdentityParts<'static> {
        IdentityParts {
            line_id: "central",
            category: "RealTime",
            disruption_type: "lineInfo",
            created,
            description,
        }
    }

    #[test]
    fn timestamp_identity_ignores_description() {
        let created = Some(Utc.with_ymd_and_hms(2026, 3, 2, 7, 58, 0).unwrap());
        let (a, basis) = derive_identity(&parts(created, "Severe delays"));
        let (b, _) = derive_identity(&parts(created, "Minor delays now"));
        assert_eq!(a, b);
        assert_eq!(basis, IdentityBasis::CreatedTimestamp);
        assert!(a.as_str().starts_with("disr-real-"));
        assert_eq!(a.as_str().len(), "disr-real-".len() + 16);
    }

    #[test]
    fn new_created_timestamp_is_a_new_identity() {
        let t1 = Some(Utc.with_ymd_and_hms(2026, 3, 2, 7, 58, 0).unwrap());
        let t2 = Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 10, 0).unwrap());
        assert_ne!(
            derive_identity(&parts(t1, "Severe delays")).0,
            derive_identity(&parts(t2, "Severe delays")).0
        );
    }

    #[test]
    fn fallback_hashes_normalised_text() {
        let (a, basis) = derive_identity(&parts(None, "Severe  delays\tdue to signals"));
        let (b, _) = derive_identity(&parts(None, "SEVERE delays due to signals"));
        assert_eq!(a, b);
        assert_eq!(basis, IdentityBasis::TextHash);
        assert!(a.as_str().starts_with("disr-real-t"));

        let (c, _) = derive_identity(&parts(None, "Minor delays"));
        assert_ne!(a, c);
    }

    #[test]
    fn fallback_never_collides_with_timestamp_path() {
        let created = Some(Utc.with_ymd_and_hms(2026, 3, 2, 7, 58, 0).unwrap());
        let (a, _) = derive_identity(&parts(created, "x"));
        let (b, _) = derive_identity(&parts(None, "x"));
        assert_ne!(a, b);
    }

    #[test]
    fn category_prefix_handles_odd_input() {
        assert_eq!(category_prefix("PlannedWork"), "plan");
        assert_eq!(category_prefix(""), "unkn");
        assert_eq!(category_prefix("-"), "unkn");
    }
}
