//! Pulse-State: persistence for the Transit Pulse learner
//!
//! This crate owns every I/O boundary with the database. The learner
//! depends only on the async traits in [`storage_traits`]; SurrealDB is one
//! implementation and [`fakes`] provides in-memory doubles for tests.
//!
//! ## Key Components
//!
//! - `DisruptionStore`: lifecycle records keyed by disruption identity
//! - `SeverityStore`: per-(mode, level) delay estimates
//! - `SampleStore`: append-only delay samples
//! - `TopologyStore`: major interchange stop query
//! - `SurrealTransitStore`: SurrealDB implementation of all of the above

mod error;
pub mod fakes;
pub mod handle;
mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{Credentials, DbTarget};
pub use storage_traits::{
    DelaySample, DisruptionId, DisruptionRecord, DisruptionStore, IdentityBasis, LifecycleState,
    MajorStop, SampleStore, SectionBounds, SeverityKey, SeverityLevelEstimate, SeverityStore,
    StorageResult, SuspensionKind, TopologyStore, TransitStore,
};
pub use surreal_store::SurrealTransitStore;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
