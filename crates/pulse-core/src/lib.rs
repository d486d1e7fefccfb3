//! Pulse Core: disruption lifecycle reconciler and severity learner
//!
//! Each poll cycle reads the live status feed, classifies and reconciles
//! disruptions against the tracked table, persists lifecycle transitions,
//! and (on its sampling cadence) measures real headways at major stops to
//! refine the per-severity delay estimates.

pub mod analyzer;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod obs;
pub mod reference;
pub mod retry;
pub mod sampler;
pub mod scheduler;
pub mod severity;
pub mod telemetry;

pub use analyzer::{Analyzer, Classification};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KeywordConfig, LearnerConfig};
pub use controller::{CycleErrors, CycleResult, InitReport, LearningController};
pub use error::{ConfigError, CoreError, Result};
pub use identity::{derive_identity, IdentityParts};
pub use lifecycle::{reconcile, DisruptionTable, Observation, Reconciliation, Transition};
pub use metrics::METRICS;
pub use sampler::{DelaySampler, HeadwayProvider, NominalHeadways, SamplingPolicy};
pub use scheduler::MonitorHandle;
pub use severity::{EstimateUpdate, MergeParams, SeverityModel};
