//! Authoritative merged state for one job.
//!
//! Every inbound event, whether pushed or polled, enters through
//! [`JobStateStore::merge_at`] (or [`JobStateStore::apply_snapshot`],
//! which decomposes a snapshot into the same updates). The merge rules
//! keep the job monotonic under any delivery order:
//!
//! - progress is a ratchet: lower values are ignored;
//! - status only moves along the state machine, terminal is final;
//! - timestamps are set once, a poll value may replace an earlier poll
//!   value but never a pushed one, and nothing is cleared;
//! - output lines are appended once, gated by the [`DedupFilter`].

use serde::Serialize;
use tokio::time::Instant;

use scanwatch_core::job::clamp_progress;
use scanwatch_core::status::state_machine::{self, Transition};
use scanwatch_core::{Job, JobId, JobSnapshot, JobStatus, Timestamp, Update};

use crate::dedup::{DedupFilter, DEFAULT_DEDUP_CAPACITY};

/// Number of inconsistency records kept for diagnostics.
const MAX_INCONSISTENCIES: usize = 32;

/// Which transport an update arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Push,
    Poll,
}

/// A status report that contradicts the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inconsistency {
    pub job_id: JobId,
    pub current: JobStatus,
    pub reported: JobStatus,
    pub origin: Origin,
}

/// What a single merge did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The job changed and `last_update_at` was bumped.
    Applied,
    /// The content was seen before.
    Duplicate,
    /// Behind the current state (regressing progress or status).
    Stale,
    /// New content that restates the current value.
    Unchanged,
    /// Not applicable to this store (heartbeat, foreign job, unknown job).
    Ignored,
    /// Dropped because it contradicts the state machine.
    Inconsistent(Inconsistency),
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// Result of reconciling one poll snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Whether any field of the job changed.
    pub changed: bool,
    pub inconsistencies: Vec<Inconsistency>,
}

#[derive(Debug, Default)]
struct Stamp {
    source: Option<Origin>,
}

pub struct JobStateStore {
    job: Job,
    dedup: DedupFilter,
    started: Stamp,
    finished: Stamp,
    /// Number of snapshot output lines already reconciled.
    poll_cursor: usize,
    not_found: bool,
    inconsistencies: Vec<Inconsistency>,
}

impl JobStateStore {
    pub fn new(job_id: impl Into<JobId>) -> Self {
        Self::with_capacity(job_id, DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_capacity(job_id: impl Into<JobId>, dedup_capacity: usize) -> Self {
        Self {
            job: Job::new(job_id),
            dedup: DedupFilter::new(dedup_capacity),
            started: Stamp::default(),
            finished: Stamp::default(),
            poll_cursor: 0,
            not_found: false,
            inconsistencies: Vec::new(),
        }
    }

    /// Current merged view of the job.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Owned copy of the current job, for publishing.
    pub fn snapshot(&self) -> Job {
        self.job.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.job.is_terminal()
    }

    /// Whether the poll transport reported that this job does not exist.
    pub fn is_not_found(&self) -> bool {
        self.not_found
    }

    /// Progress has been observed but the start time is still unknown.
    pub fn needs_start_time(&self) -> bool {
        self.job.progress > 0 && self.job.started_at.is_none()
    }

    /// Recent status reports that contradicted the state machine.
    pub fn inconsistencies(&self) -> &[Inconsistency] {
        &self.inconsistencies
    }

    /// Merge a pushed update, stamped with the current time.
    pub fn merge(&mut self, update: &Update) -> MergeOutcome {
        self.merge_at(update, Origin::Push, Instant::now())
    }

    /// Merge one update.
    pub fn merge_at(&mut self, update: &Update, origin: Origin, now: Instant) -> MergeOutcome {
        if self.not_found {
            return MergeOutcome::Ignored;
        }

        match update {
            Update::Heartbeat => MergeOutcome::Ignored,
            Update::JobUpdate { job_id, .. } => {
                tracing::debug!(
                    job_id = %self.job.id,
                    foreign_job_id = %job_id,
                    "Ignoring list-view update on a single-job store",
                );
                MergeOutcome::Ignored
            }
            Update::Progress(value) => self.merge_progress(update, *value, now),
            Update::Status {
                status,
                started_at,
                finished_at,
            } => self.merge_status(update, *status, *started_at, *finished_at, origin, now),
            Update::Output(line) => {
                // Fingerprints are evicted at the terminal transition, so a
                // finished job checks its own log instead.
                if self.job.is_terminal() && self.job.output_log.contains(line) {
                    return MergeOutcome::Duplicate;
                }
                if !self.dedup.accept(update) {
                    return MergeOutcome::Duplicate;
                }
                self.job.output_log.push(line.clone());
                self.touch(now);
                MergeOutcome::Applied
            }
        }
    }

    /// Reconcile an authoritative poll snapshot.
    ///
    /// Only output lines past the poll cursor are considered; earlier
    /// lines were reconciled by a previous snapshot. Lines that push
    /// already delivered are skipped, before and after the job finishes.
    pub fn apply_snapshot(&mut self, snapshot: &JobSnapshot, now: Instant) -> SnapshotOutcome {
        let mut outcome = SnapshotOutcome::default();

        if self.not_found {
            return outcome;
        }
        if snapshot.id != self.job.id {
            tracing::warn!(
                job_id = %self.job.id,
                snapshot_id = %snapshot.id,
                "Ignoring snapshot for a different job",
            );
            return outcome;
        }

        if self.job.targets.is_empty() && !snapshot.targets.is_empty() {
            self.job.targets = snapshot.targets.clone();
            outcome.changed = true;
        }
        if snapshot.name.is_some() && snapshot.name != self.job.name {
            self.job.name = snapshot.name.clone();
            outcome.changed = true;
        }

        // Output goes first, while the fingerprints of pushed lines are
        // still in the filter.
        if snapshot.output_log.len() < self.poll_cursor {
            tracing::warn!(
                job_id = %self.job.id,
                cursor = self.poll_cursor,
                snapshot_lines = snapshot.output_log.len(),
                "Snapshot output log is shorter than previously reconciled",
            );
        }
        for line in snapshot.output_log.iter().skip(self.poll_cursor) {
            let merged = self.merge_at(&Update::Output(line.clone()), Origin::Poll, now);
            record(merged, &mut outcome);
        }
        self.poll_cursor = self.poll_cursor.max(snapshot.output_log.len());

        let updates = [
            Update::Status {
                status: snapshot.status,
                started_at: snapshot.started_at,
                finished_at: snapshot.finished_at,
            },
            Update::Progress(snapshot.progress),
        ];
        for update in &updates {
            let merged = self.merge_at(update, Origin::Poll, now);
            record(merged, &mut outcome);
        }

        if outcome.changed {
            self.touch(now);
        }
        outcome
    }

    /// Fill in timestamps without a status change.
    pub fn merge_timestamps(
        &mut self,
        started_at: Option<Timestamp>,
        finished_at: Option<Timestamp>,
        origin: Origin,
        now: Instant,
    ) -> bool {
        if self.not_found {
            return false;
        }
        let changed = self.fill_timestamps(started_at, finished_at, origin);
        if changed {
            self.touch(now);
        }
        changed
    }

    /// Explicit reset of progress to zero, as requested by a list-view
    /// update carrying `progress: null`.
    pub fn reset_progress(&mut self, now: Instant) -> bool {
        if self.not_found || self.job.progress == 0 {
            return false;
        }
        self.job.progress = 0;
        self.dedup.forget_progress();
        self.touch(now);
        true
    }

    pub fn set_name(&mut self, name: Option<String>, now: Instant) -> bool {
        if self.not_found || self.job.name == name {
            return false;
        }
        self.job.name = name;
        self.touch(now);
        true
    }

    /// Record that the poll transport does not know this job. Terminal:
    /// every later merge is ignored.
    pub fn mark_not_found(&mut self) -> bool {
        if self.not_found {
            return false;
        }
        tracing::info!(job_id = %self.job.id, "Job not found");
        self.not_found = true;
        self.dedup.evict();
        true
    }

    // ---- private helpers ----

    fn merge_progress(&mut self, update: &Update, value: i64, now: Instant) -> MergeOutcome {
        if !self.dedup.accept(update) {
            return MergeOutcome::Duplicate;
        }
        let value = clamp_progress(value);
        if value < self.job.progress {
            tracing::debug!(
                job_id = %self.job.id,
                current = self.job.progress,
                reported = value,
                "Ignoring regressing progress",
            );
            return MergeOutcome::Stale;
        }
        if value == self.job.progress {
            return MergeOutcome::Unchanged;
        }

        self.job.progress = value;
        if self.job.status == JobStatus::Pending {
            self.job.status = JobStatus::Running;
        }
        self.touch(now);
        MergeOutcome::Applied
    }

    fn merge_status(
        &mut self,
        update: &Update,
        status: JobStatus,
        started_at: Option<Timestamp>,
        finished_at: Option<Timestamp>,
        origin: Origin,
        now: Instant,
    ) -> MergeOutcome {
        let stamped = self.fill_timestamps(started_at, finished_at, origin);

        let outcome = if !self.dedup.accept(update) {
            MergeOutcome::Duplicate
        } else {
            self.transition(status, origin)
        };

        match outcome {
            MergeOutcome::Applied => {
                self.touch(now);
                MergeOutcome::Applied
            }
            other if stamped => {
                self.touch(now);
                if let MergeOutcome::Inconsistent(_) = other {
                    other
                } else {
                    MergeOutcome::Applied
                }
            }
            other => other,
        }
    }

    fn transition(&mut self, to: JobStatus, origin: Origin) -> MergeOutcome {
        let from = self.job.status;
        match state_machine::classify(from, to) {
            Transition::Unchanged => MergeOutcome::Unchanged,
            Transition::Allowed => {
                self.set_status(to);
                MergeOutcome::Applied
            }
            Transition::Implied(path) => {
                tracing::debug!(
                    job_id = %self.job.id,
                    %from,
                    %to,
                    "Applying implied intermediate status",
                );
                for &step in path {
                    self.set_status(step);
                }
                MergeOutcome::Applied
            }
            Transition::Stale => {
                tracing::debug!(
                    job_id = %self.job.id,
                    %from,
                    %to,
                    ?origin,
                    "Ignoring stale status",
                );
                MergeOutcome::Stale
            }
            Transition::Conflict => {
                let inconsistency = Inconsistency {
                    job_id: self.job.id.clone(),
                    current: from,
                    reported: to,
                    origin,
                };
                tracing::warn!(
                    job_id = %self.job.id,
                    current = %from,
                    reported = %to,
                    ?origin,
                    "Status report contradicts terminal state",
                );
                if self.inconsistencies.len() >= MAX_INCONSISTENCIES {
                    self.inconsistencies.remove(0);
                }
                self.inconsistencies.push(inconsistency.clone());
                MergeOutcome::Inconsistent(inconsistency)
            }
        }
    }

    fn set_status(&mut self, status: JobStatus) {
        self.job.status = status;
        if status.is_terminal() {
            tracing::info!(
                job_id = %self.job.id,
                %status,
                fingerprints = self.dedup.len(),
                "Job reached terminal status",
            );
            self.dedup.evict();
        }
    }

    fn fill_timestamps(
        &mut self,
        started_at: Option<Timestamp>,
        finished_at: Option<Timestamp>,
        origin: Origin,
    ) -> bool {
        let started = fill_stamp(&mut self.job.started_at, &mut self.started, started_at, origin);
        let finished = fill_stamp(
            &mut self.job.finished_at,
            &mut self.finished,
            finished_at,
            origin,
        );
        started || finished
    }

    fn touch(&mut self, now: Instant) {
        self.job.last_update_at = Some(match self.job.last_update_at {
            Some(prev) if prev > now => prev,
            _ => now,
        });
    }
}

fn record(merged: MergeOutcome, outcome: &mut SnapshotOutcome) {
    match merged {
        MergeOutcome::Applied => outcome.changed = true,
        MergeOutcome::Inconsistent(i) => outcome.inconsistencies.push(i),
        _ => {}
    }
}

/// Set-once timestamp merge. A polled value may be replaced by a later
/// polled value as long as push never supplied one.
fn fill_stamp(
    slot: &mut Option<Timestamp>,
    stamp: &mut Stamp,
    incoming: Option<Timestamp>,
    origin: Origin,
) -> bool {
    let Some(value) = incoming else {
        return false;
    };
    match (*slot, stamp.source) {
        (None, _) => {
            *slot = Some(value);
            stamp.source = Some(origin);
            true
        }
        (Some(current), Some(Origin::Poll)) if origin == Origin::Poll && current != value => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}
