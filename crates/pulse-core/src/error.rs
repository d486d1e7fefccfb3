//! Error taxonomy for the learner.

use pulse_feed::FeedError;
use pulse_state::{SeverityKey, StorageError};

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Learner errors.
///
/// Every variant except `Config` is recoverable at cycle scope: the cycle
/// counts it into `CycleErrors` and carries on.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("feed unavailable: {0}")]
    FeedUnavailable(#[from] FeedError),

    #[error("malformed record: missing {field}")]
    MalformedRecord { field: &'static str },

    #[error("identity ambiguity: {id} matched more than one snapshot item")]
    IdentityAmbiguity { id: String },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    #[error("sampling failed at stop {stop_id}: {reason}")]
    SamplingFailure { stop_id: String, reason: String },

    #[error("cycle exceeded its {timeout_secs}s timeout")]
    CycleTimeout { timeout_secs: u64 },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no severity estimate for {0}")]
    NotFound(SeverityKey),
}

/// Result type for learner operations.
pub type Result<T> = std::result::Result<T, CoreError>;
