//! Signals a session exposes to its consumer besides the job itself.

use std::time::Duration;

use serde::Serialize;

use crate::store::Inconsistency;

/// Health of the push link, for a "reconnecting" indicator or a
/// degraded banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; updates arrive by polling only.
    Degraded,
    Closed,
}

impl LinkState {
    pub fn is_degraded(self) -> bool {
        matches!(self, LinkState::Degraded)
    }
}

/// A session-level event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Degraded,

    /// A status report contradicted the state machine and was dropped.
    Inconsistency(Inconsistency),

    /// The poll transport does not know the job. Distinct from a failed job.
    NotFound,

    PollFailed {
        error: String,
    },

    /// The job is terminal and quiet; the consumer may swap to its
    /// finished view. Emitted at most once per session.
    TransitionRequested,
}
