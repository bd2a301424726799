//! The merged client-side view of a job and the poll snapshot shape.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::status::JobStatus;
use crate::types::{JobId, Timestamp};

/// Upper bound of the progress scale.
pub const MAX_PROGRESS: u8 = 100;

/// One monitored unit of work, as currently known to the client.
///
/// Only the synchronization core mutates a `Job`; consumers receive
/// clones through the session's read accessor and subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Display name, only carried by list-view updates.
    pub name: Option<String>,
    pub status: JobStatus,
    /// Completion percentage (0-100), never decreases.
    pub progress: u8,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Append-only scan output.
    pub output_log: Vec<String>,
    /// Scan targets, fixed once first observed.
    pub targets: Vec<String>,
    /// When the most recent merge was accepted. Drives quiescence.
    #[serde(skip)]
    pub last_update_at: Option<Instant>,
}

impl Job {
    /// A freshly observed job with nothing known about it yet.
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            status: JobStatus::Pending,
            progress: 0,
            started_at: None,
            finished_at: None,
            output_log: Vec::new(),
            targets: Vec::new(),
            last_update_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Authoritative job state returned by the poll transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    #[serde(alias = "job_id", alias = "jobId")]
    pub id: JobId,
    #[serde(default)]
    pub name: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: i64,
    #[serde(default, alias = "started_at")]
    pub started_at: Option<Timestamp>,
    #[serde(default, alias = "finished_at")]
    pub finished_at: Option<Timestamp>,
    #[serde(default, alias = "output_log", alias = "output")]
    pub output_log: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Clamp a wire progress value onto the 0-100 scale.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, MAX_PROGRESS as i64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_and_empty() {
        let job = Job::new("scan-1");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.output_log.is_empty());
        assert!(job.last_update_at.is_none());
    }

    #[test]
    fn snapshot_accepts_camel_and_snake_case() {
        let camel = r#"{"id":"a","status":"running","progress":40,"startedAt":"2026-01-02T03:04:05Z","outputLog":["x"],"targets":["10.0.0.1"]}"#;
        let snake = r#"{"job_id":"a","status":"running","progress":40,"started_at":"2026-01-02T03:04:05Z","output_log":["x"],"targets":["10.0.0.1"]}"#;

        let a: JobSnapshot = serde_json::from_str(camel).unwrap();
        let b: JobSnapshot = serde_json::from_str(snake).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.output_log, vec!["x"]);
        assert!(a.finished_at.is_none());
    }

    #[test]
    fn serialized_job_omits_internal_clock() {
        let json = serde_json::to_value(Job::new("a")).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("lastUpdateAt").is_none());
        assert!(json["startedAt"].is_null());
    }

    #[test]
    fn clamp_progress_bounds() {
        assert_eq!(clamp_progress(-5), 0);
        assert_eq!(clamp_progress(42), 42);
        assert_eq!(clamp_progress(250), 100);
    }
}
