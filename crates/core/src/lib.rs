//! Domain types shared by the scanwatch synchronization core.
//!
//! This crate has no transport or runtime logic: it defines the job
//! model, the status state machine and the tagged [`Update`] union that
//! every inbound event is normalised into.

pub mod error;
pub mod job;
pub mod status;
pub mod types;
pub mod update;

pub use error::CoreError;
pub use job::{Job, JobSnapshot};
pub use status::JobStatus;
pub use types::{JobId, Timestamp};
pub use update::{JobPatch, Patch, Update};
