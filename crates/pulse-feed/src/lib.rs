//! Pulse-Feed: live status feed client for Transit Pulse
//!
//! The learner reads the network only through [`FeedClient`]. [`TflClient`]
//! talks to the TfL Unified API; [`fakes::ScriptedFeedClient`] replays
//! scripted snapshots in tests.

pub mod client;
mod error;
pub mod fakes;
pub mod tfl;
pub mod types;

pub use client::FeedClient;
pub use error::{FeedError, FeedResult};
pub use tfl::{parse_timestamp, TflClient, TflConfig};
pub use types::{
    AffectedRoute, AffectedStop, ArrivalPrediction, RawDisruption, SectionEntry, SeverityCode,
    StopPointLines,
};
