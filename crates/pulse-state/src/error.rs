//! Error types for pulse-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage trait operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Requested entity does not exist
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A resolved disruption record may not be written again
    #[error("disruption {id} is resolved and immutable")]
    ImmutableRecord { id: String },

    /// Backend (database / transport) failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Row could not be converted to or from its stored form
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display_names_entity() {
        let err = StorageError::NotFound {
            entity: "severity estimate",
            key: "tube/6".to_string(),
        };
        assert_eq!(err.to_string(), "severity estimate not found: tube/6");

        let err = StorageError::ImmutableRecord {
            id: "disr-real-0123".to_string(),
        };
        assert!(err.to_string().contains("immutable"));
    }
}
