//! Learner configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `PULSE_*` environment overrides. The result is validated before use.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Classifier marker lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    pub suspension: Vec<String>,
    pub partial: Vec<String>,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        Self {
            suspension: owned(&[
                "suspended",
                "no service",
                "closed",
                "not running",
                "not stopping",
                "service suspended",
            ]),
            partial: owned(&[
                "part",
                "partial",
                "partially",
                "part suspended",
                "part closure",
                "partial closure",
                "section closed",
                "between",
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub modes: Vec<String>,
    pub poll_interval_secs: u64,
    pub cycle_timeout_secs: u64,
    pub learning_enabled: bool,

    pub sample_every_n: u64,
    pub confidence_threshold: f64,
    pub high_confidence_threshold: f64,
    pub min_samples_for_update: usize,
    pub growth_factor: f64,
    pub prior_pseudo_samples: f64,
    pub initial_confidence: f64,

    pub major_stop_threshold: u32,
    pub max_major_stops: usize,
    pub max_stops_per_cycle: usize,
    pub max_concurrent_stops: usize,
    pub max_arrivals_per_line: usize,

    pub tombstone_retention_hours: i64,

    /// Nominal headway per mode, in seconds
    pub default_headway_secs: BTreeMap<String, f64>,
    pub fallback_headway_secs: f64,

    pub keywords: KeywordConfig,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        let headways = [
            ("tube", 180.0),
            ("dlr", 300.0),
            ("overground", 600.0),
            ("elizabeth-line", 300.0),
        ];
        Self {
            modes: ["tube", "dlr", "overground", "elizabeth-line"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            poll_interval_secs: 120,
            cycle_timeout_secs: 60,
            learning_enabled: true,
            sample_every_n: 10,
            confidence_threshold: 0.75,
            high_confidence_threshold: 0.90,
            min_samples_for_update: 20,
            growth_factor: 0.10,
            prior_pseudo_samples: 20.0,
            initial_confidence: 0.30,
            major_stop_threshold: 3,
            max_major_stops: 30,
            max_stops_per_cycle: 5,
            max_concurrent_stops: 4,
            max_arrivals_per_line: 10,
            tombstone_retention_hours: 168,
            default_headway_secs: headways
                .iter()
                .map(|(mode, secs)| (mode.to_string(), *secs))
                .collect(),
            fallback_headway_secs: 300.0,
            keywords: KeywordConfig::default(),
        }
    }
}

impl LearnerConfig {
    /// Load from an optional TOML file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `PULSE_*` overrides from the given variables.
    ///
    /// Unknown `PULSE_*` keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("PULSE_") else {
                continue;
            };
            match name {
                "MODES" => {
                    self.modes = value
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "POLL_INTERVAL_SECS" => self.poll_interval_secs = parse(&key, &value)?,
                "CYCLE_TIMEOUT_SECS" => self.cycle_timeout_secs = parse(&key, &value)?,
                "LEARNING_ENABLED" => self.learning_enabled = parse(&key, &value)?,
                "SAMPLE_EVERY_N" => self.sample_every_n = parse(&key, &value)?,
                "CONFIDENCE_THRESHOLD" => self.confidence_threshold = parse(&key, &value)?,
                "HIGH_CONFIDENCE_THRESHOLD" => {
                    self.high_confidence_threshold = parse(&key, &value)?
                }
                "MIN_SAMPLES_FOR_UPDATE" => self.min_samples_for_update = parse(&key, &value)?,
                "GROWTH_FACTOR" => self.growth_factor = parse(&key, &value)?,
                "MAJOR_STOP_THRESHOLD" => self.major_stop_threshold = parse(&key, &value)?,
                "MAX_MAJOR_STOPS" => self.max_major_stops = parse(&key, &value)?,
                "MAX_STOPS_PER_CYCLE" => self.max_stops_per_cycle = parse(&key, &value)?,
                "MAX_CONCURRENT_STOPS" => self.max_concurrent_stops = parse(&key, &value)?,
                "TOMBSTONE_RETENTION_HOURS" => {
                    self.tombstone_retention_hours = parse(&key, &value)?
                }
                _ => continue,
            }
            debug!(key = %key, "config override applied");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=0.95).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 0.95], got {v}")))
            }
        };
        unit("confidence_threshold", self.confidence_threshold)?;
        unit("high_confidence_threshold", self.high_confidence_threshold)?;
        unit("initial_confidence", self.initial_confidence)?;

        if self.high_confidence_threshold < self.confidence_threshold {
            return Err(ConfigError::Invalid(
                "high_confidence_threshold must not be below confidence_threshold".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.growth_factor) {
            return Err(ConfigError::Invalid("growth_factor must be within [0, 1]".into()));
        }
        if self.sample_every_n == 0 {
            return Err(ConfigError::Invalid("sample_every_n must be at least 1".into()));
        }
        if self.min_samples_for_update == 0 {
            return Err(ConfigError::Invalid(
                "min_samples_for_update must be at least 1".into(),
            ));
        }
        if self.max_concurrent_stops == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_stops must be at least 1".into(),
            ));
        }
        if self.poll_interval_secs == 0 || self.cycle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs and cycle_timeout_secs must be positive".into(),
            ));
        }
        if self.keywords.suspension.is_empty() || self.keywords.partial.is_empty() {
            return Err(ConfigError::Invalid("keyword lists must not be empty".into()));
        }
        if self.modes.is_empty() {
            return Err(ConfigError::Invalid("at least one mode is required".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.tombstone_retention_hours)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}
