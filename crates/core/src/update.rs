//! Inbound updates, normalised from both transports.
//!
//! An [`Update`] is a value: once parsed it is never mutated, only
//! merged into a store.

use serde::{Deserialize, Deserializer};

use crate::status::JobStatus;
use crate::types::{JobId, Timestamp};

/// Every kind of inbound state change the core understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Progress percentage as reported on the wire (clamped on merge).
    Progress(i64),

    /// Status change, optionally carrying authoritative timestamps.
    Status {
        status: JobStatus,
        started_at: Option<Timestamp>,
        finished_at: Option<Timestamp>,
    },

    /// One line of scan output.
    Output(String),

    /// Keep-alive with no state. Always discarded.
    Heartbeat,

    /// Partial update for one job on a shared, many-job stream.
    JobUpdate { job_id: JobId, patch: JobPatch },
}

impl Update {
    /// Status update without timestamps.
    pub fn status(status: JobStatus) -> Self {
        Update::Status {
            status,
            started_at: None,
            finished_at: None,
        }
    }

    /// Short tag used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Update::Progress(_) => "progress",
            Update::Status { .. } => "status",
            Update::Output(_) => "output",
            Update::Heartbeat => "heartbeat",
            Update::JobUpdate { .. } => "scan_update",
        }
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// One field of a partial update.
///
/// An absent field deserializes to [`Patch::Unchanged`] (with
/// `#[serde(default)]`), an explicit `null` to [`Patch::Reset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch<T> {
    Unchanged,
    Reset,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Unchanged
    }
}

impl<T> Patch<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Patch::Unchanged)
    }

    /// The carried value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Patch::Set(v) => Some(v),
            _ => None,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Patch::Set(value),
            None => Patch::Reset,
        })
    }
}

/// The fields a list-view update may carry for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub status: Patch<JobStatus>,
    pub progress: Patch<i64>,
    pub started_at: Patch<Timestamp>,
    pub finished_at: Patch<Timestamp>,
    pub name: Patch<String>,
}

impl JobPatch {
    /// True when the patch carries no field at all.
    pub fn is_empty(&self) -> bool {
        self.status.is_unchanged()
            && self.progress.is_unchanged()
            && self.started_at.is_unchanged()
            && self.finished_at.is_unchanged()
            && self.name.is_unchanged()
    }
}
