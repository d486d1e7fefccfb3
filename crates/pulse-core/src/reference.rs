//! Built-in severity reference table used to seed estimates.

use chrono::{DateTime, Utc};
use pulse_feed::SeverityCode;
use pulse_state::{SeverityKey, SeverityLevelEstimate};

/// Severity levels published for rail modes, with their labels.
pub const SEVERITY_LEVELS: &[(i32, &str)] = &[
    (0, "Special Service"),
    (1, "Closed"),
    (2, "Suspended"),
    (3, "Part Suspended"),
    (4, "Planned Closure"),
    (5, "Part Closure"),
    (6, "Severe Delays"),
    (7, "Reduced Service"),
    (8, "Bus Service"),
    (9, "Minor Delays"),
    (10, "Good Service"),
    (11, "Part Closed"),
    (12, "Exit Only"),
    (13, "No Step Free Access"),
    (14, "Change of frequency"),
    (15, "Diverted"),
    (16, "Not Running"),
    (17, "Issues Reported"),
    (18, "No Issues"),
    (19, "Information"),
    (20, "Service Closed"),
];

const SUSPENSION_HINTS: &[&str] = &["suspend", "closed", "closure", "no service", "not running"];

pub fn is_suspension_description(description: &str) -> bool {
    let lower = description.to_lowercase();
    SUSPENSION_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Starting delay, in minutes, for a non-suspension severity description.
pub fn initial_delay_minutes(description: &str) -> f64 {
    let lower = description.to_lowercase();
    if lower.contains("severe") {
        12.0
    } else if lower.contains("reduced") {
        8.0
    } else if lower.contains("minor") {
        5.0
    } else if lower.contains("bus service") || lower.contains("diverted") {
        10.0
    } else if lower.contains("special") || lower.contains("frequency") {
        3.0
    } else if lower.contains("issues reported") {
        2.0
    } else if lower.contains("good service")
        || lower.contains("no issues")
        || lower.contains("information")
        || lower.contains("exit only")
        || lower.contains("step free")
    {
        0.0
    } else {
        10.0
    }
}

/// Build a fresh estimate for one severity code.
pub fn seed_estimate(
    key: SeverityKey,
    description: &str,
    confidence: f64,
    now: DateTime<Utc>,
) -> SeverityLevelEstimate {
    let is_suspension = is_suspension_description(description);
    SeverityLevelEstimate {
        key,
        description: description.to_string(),
        estimated_delay_minutes: if is_suspension {
            0.0
        } else {
            initial_delay_minutes(description)
        },
        confidence_score: confidence,
        sample_count: 0,
        is_suspension,
        last_updated: now,
    }
}

/// Reference estimates for every level of every mode.
pub fn reference_estimates(
    modes: &[String],
    confidence: f64,
    now: DateTime<Utc>,
) -> Vec<SeverityLevelEstimate> {
    modes
        .iter()
        .flat_map(|mode| {
            SEVERITY_LEVELS.iter().map(move |(level, description)| {
                seed_estimate(SeverityKey::new(mode.clone(), *level), description, confidence, now)
            })
        })
        .collect()
}

/// Estimates for severity codes published by the feed.
pub fn estimates_from_codes(
    codes: &[SeverityCode],
    confidence: f64,
    now: DateTime<Utc>,
) -> Vec<SeverityLevelEstimate> {
    codes
        .iter()
        .map(|code| {
            seed_estimate(
                SeverityKey::new(code.mode.clone(), code.level),
                &code.description,
                confidence,
                now,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspension_levels_are_flagged_with_zero_delay() {
        let now = Utc::now();
        let estimates = reference_estimates(&["tube".to_string()], 0.3, now);
        assert_eq!(estimates.len(), SEVERITY_LEVELS.len());

        let by_level = |level: i32| estimates.iter().find(|e| e.key.level == level).unwrap();
        for level in [1, 2, 3, 4, 5, 11, 16, 20] {
            let e = by_level(level);
            assert!(e.is_suspension, "level {level} should be a suspension");
            assert_eq!(e.estimated_delay_minutes, 0.0);
        }
        assert!(!by_level(6).is_suspension);
        assert_eq!(by_level(6).estimated_delay_minutes, 12.0);
        assert_eq!(by_level(9).estimated_delay_minutes, 5.0);
        assert_eq!(by_level(10).estimated_delay_minutes, 0.0);
        assert!(estimates.iter().all(|e| e.confidence_score == 0.3 && e.sample_count == 0));
    }

    #[test]
    fn feed_codes_seed_per_mode() {
        let codes = vec![
            SeverityCode {
                mode: "dlr".into(),
                level: 6,
                description: "Severe Delays".into(),
            },
            SeverityCode {
                mode: "dlr".into(),
                level: 20,
                description: "Service Closed".into(),
            },
        ];
        let estimates = estimates_from_codes(&codes, 0.3, Utc::now());
        assert_eq!(estimates[0].key, SeverityKey::new("dlr", 6));
        assert!(!estimates[0].is_suspension);
        assert!(estimates[1].is_suspension);
    }

    #[test]
    fn unknown_descriptions_get_a_middling_delay() {
        assert_eq!(initial_delay_minutes("Something new"), 10.0);
    }
}
