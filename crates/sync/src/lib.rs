//! Live job-status synchronization.
//!
//! Merges a push stream and a backstop poll of the scan API into one
//! monotonic view per job, and decides when a finished job is quiet
//! enough for the consumer to swap to its final view. Consumers start a
//! [`ScanSession`] (one job) or a [`ListSession`] (many jobs) and read
//! state through the returned handle.

pub mod aggregator;
pub mod api;
pub mod client;
pub mod config;
pub mod dedup;
pub mod events;
pub mod list;
pub mod messages;
pub mod poll;
pub mod push;
pub mod quiescence;
pub mod reconnect;
pub mod session;
pub mod store;

pub use aggregator::MultiJobAggregator;
pub use api::{ApiError, PollOutcome, ScanApi, SnapshotSource};
pub use client::{ClientError, PushAddress, PushConnector, WsConnector};
pub use config::{ConfigError, SyncConfig};
pub use dedup::DedupFilter;
pub use events::{LinkState, SyncEvent};
pub use list::{ListHandle, ListSession};
pub use poll::{PollChannel, PollEvent, PollTarget};
pub use push::{PushChannel, PushEvent};
pub use quiescence::{QuiescenceDetector, TransitionGuard};
pub use session::{ScanSession, SessionHandle};
pub use store::{Inconsistency, JobStateStore, MergeOutcome, Origin};
