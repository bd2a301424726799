//! Push transport frame types and parser.
//!
//! The scan API streams UTF-8 text frames shaped like
//! `{"type": "<kind>", ...fields}`. This module deserializes them into a
//! strongly-typed [`PushFrame`] and converts that into the core
//! [`Update`] union. Unknown `type` values are rejected rather than
//! coerced.

use serde::Deserialize;
use scanwatch_core::{JobId, JobPatch, JobStatus, Patch, Timestamp, Update};

/// In-band keep-alive marker. A frame whose text is exactly this string
/// carries no state.
pub const HEARTBEAT_MARKER: &str = "__heartbeat__";

/// All known push frame types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    /// Progress percentage for the connection's job.
    Progress {
        #[serde(alias = "progress")]
        value: i64,
    },

    /// Status change for the connection's job.
    Status {
        status: JobStatus,
        #[serde(default, rename = "startedAt", alias = "started_at")]
        started_at: Option<Timestamp>,
        #[serde(default, rename = "finishedAt", alias = "finished_at")]
        finished_at: Option<Timestamp>,
    },

    /// One line of scan output.
    Output {
        #[serde(alias = "data")]
        line: String,
    },

    /// JSON form of the keep-alive.
    Heartbeat,

    /// Partial update for one job on a consumer-wide stream.
    ScanUpdate(ScanUpdateData),
}

/// Payload for `scan_update` frames. Absent fields mean "unchanged",
/// explicit `null` means "reset".
#[derive(Debug, Clone, Deserialize)]
pub struct ScanUpdateData {
    #[serde(rename = "jobId", alias = "job_id")]
    pub job_id: JobId,
    #[serde(default)]
    pub status: Patch<JobStatus>,
    #[serde(default)]
    pub progress: Patch<i64>,
    #[serde(default, rename = "startedAt", alias = "started_at")]
    pub started_at: Patch<Timestamp>,
    #[serde(default, rename = "finishedAt", alias = "finished_at")]
    pub finished_at: Patch<Timestamp>,
    #[serde(default)]
    pub name: Patch<String>,
}

impl From<PushFrame> for Update {
    fn from(frame: PushFrame) -> Self {
        match frame {
            PushFrame::Progress { value } => Update::Progress(value),
            PushFrame::Status {
                status,
                started_at,
                finished_at,
            } => Update::Status {
                status,
                started_at,
                finished_at,
            },
            PushFrame::Output { line } => Update::Output(line),
            PushFrame::Heartbeat => Update::Heartbeat,
            PushFrame::ScanUpdate(data) => Update::JobUpdate {
                job_id: data.job_id,
                patch: JobPatch {
                    status: data.status,
                    progress: data.progress,
                    started_at: data.started_at,
                    finished_at: data.finished_at,
                    name: data.name,
                },
            },
        }
    }
}

/// Errors produced while decoding a push frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Invalid JSON, an unknown `type`, or a field of the wrong shape.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse a push text frame into an [`Update`].
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log the error and drop the frame.
pub fn parse_frame(text: &str) -> Result<Update, FrameError> {
    if text.trim() == HEARTBEAT_MARKER {
        return Ok(Update::Heartbeat);
    }
    let frame: PushFrame = serde_json::from_str(text)?;
    Ok(frame.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_progress_frame() {
        let update = parse_frame(r#"{"type":"progress","value":42}"#).unwrap();
        assert_eq!(update, Update::Progress(42));
    }

    #[test]
    fn parse_progress_frame_with_alias() {
        let update = parse_frame(r#"{"type":"progress","progress":7}"#).unwrap();
        assert_eq!(update, Update::Progress(7));
    }

    #[test]
    fn parse_status_frame_with_timestamps() {
        let json = r#"{"type":"status","status":"completed","startedAt":"2026-03-01T10:00:00Z","finishedAt":"2026-03-01T10:05:00Z"}"#;
        match parse_frame(json).unwrap() {
            Update::Status {
                status,
                started_at,
                finished_at,
            } => {
                assert_eq!(status, JobStatus::Completed);
                assert!(started_at.is_some());
                assert!(finished_at.is_some());
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_status_frame_without_timestamps() {
        let update = parse_frame(r#"{"type":"status","status":"running"}"#).unwrap();
        assert_eq!(update, Update::status(JobStatus::Running));
    }

    #[test]
    fn parse_output_frame() {
        let update = parse_frame(r#"{"type":"output","line":"Discovered port 80"}"#).unwrap();
        assert_eq!(update, Update::Output("Discovered port 80".into()));
    }

    #[test]
    fn heartbeat_marker_and_json_heartbeat() {
        assert_eq!(parse_frame(HEARTBEAT_MARKER).unwrap(), Update::Heartbeat);
        assert_eq!(
            parse_frame(r#"{"type":"heartbeat"}"#).unwrap(),
            Update::Heartbeat
        );
    }

    #[test]
    fn parse_scan_update_distinguishes_absent_and_null() {
        let json = r#"{"type":"scan_update","jobId":"j1","progress":null,"status":"running"}"#;
        match parse_frame(json).unwrap() {
            Update::JobUpdate { job_id, patch } => {
                assert_eq!(job_id, "j1");
                assert_eq!(patch.progress, Patch::Reset);
                assert_eq!(patch.status, Patch::Set(JobStatus::Running));
                assert_eq!(patch.name, Patch::Unchanged);
                assert_eq!(patch.started_at, Patch::Unchanged);
            }
            other => panic!("Expected JobUpdate, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        assert!(parse_frame(r#"{"type":"report_ready","id":"x"}"#).is_err());
    }

    #[test]
    fn parse_unknown_status_value_returns_error() {
        assert!(parse_frame(r#"{"type":"status","status":"paused"}"#).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_frame("not json at all").is_err());
    }
}
