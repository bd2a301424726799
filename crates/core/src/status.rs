//! Job status and the forward-only status state machine.
//!
//! ```text
//! Pending -> Running -> Completed
//!    |          |
//!    +----------+-----> Failed
//! ```
//!
//! `Completed` and `Failed` are terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle status of a monitored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether no further transitions are accepted from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::JobStatus;
    use crate::error::CoreError;

    /// How an inbound status relates to the current one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Transition {
        /// Inbound status equals the current status.
        Unchanged,
        /// A single legal edge of the state machine.
        Allowed,
        /// Reachable only through the listed intermediate steps, each of
        /// which is a legal edge. Apply them in order.
        Implied(&'static [JobStatus]),
        /// Inbound status is behind the current one (out-of-order delivery
        /// or a stale snapshot). Dropped without complaint.
        Stale,
        /// Two different terminal outcomes were reported for the same job.
        Conflict,
    }

    /// Returns the set of statuses reachable in one step from `from`.
    ///
    /// Terminal states return an empty slice.
    pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
        match from {
            JobStatus::Pending => &[JobStatus::Running, JobStatus::Failed],
            JobStatus::Running => &[JobStatus::Completed, JobStatus::Failed],
            JobStatus::Completed | JobStatus::Failed => &[],
        }
    }

    /// Check whether a single-step transition from `from` to `to` is legal.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a single-step transition.
    pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), CoreError> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition { from, to })
        }
    }

    /// Classify an inbound status against the current one.
    pub fn classify(from: JobStatus, to: JobStatus) -> Transition {
        use JobStatus::*;

        if from == to {
            return Transition::Unchanged;
        }
        if can_transition(from, to) {
            return Transition::Allowed;
        }
        match (from, to) {
            (Pending, Completed) => Transition::Implied(&[Running, Completed]),
            (Completed, Failed) | (Failed, Completed) => Transition::Conflict,
            _ => Transition::Stale,
        }
    }
}
