//! Feed error types

use thiserror::Error;

/// Result type for feed operations
pub type FeedResult<T> = std::result::Result<T, FeedError>;

/// Errors raised while talking to the live status feed
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Feed returned HTTP {status} for {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("Failed to decode feed payload: {0}")]
    Decode(String),

    #[error("Feed request timed out: {0}")]
    Timeout(String),

    #[error("Missing feed credentials: {0}")]
    MissingCredentials(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Timeout(err.to_string())
        } else if err.is_decode() {
            FeedError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            FeedError::Status {
                status: status.as_u16(),
                endpoint: err.url().map(|u| u.path().to_string()).unwrap_or_default(),
            }
        } else {
            FeedError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Decode(err.to_string())
    }
}
