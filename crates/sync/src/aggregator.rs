//! Keyed job stores for list views fed by one shared push stream.

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use scanwatch_core::{Job, JobId, JobPatch, JobSnapshot, Patch, Update};

use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::store::{Inconsistency, JobStateStore, MergeOutcome, Origin};

/// Result of applying one partial update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// The job was created or any of its fields changed.
    pub changed: bool,
    pub inconsistency: Option<Inconsistency>,
}

/// Many jobs, one [`JobStateStore`] each, created lazily on first sight.
pub struct MultiJobAggregator {
    jobs: HashMap<JobId, JobStateStore>,
    dedup_capacity: usize,
}

impl MultiJobAggregator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    /// Aggregator whose per-job stores remember `dedup_capacity`
    /// fingerprints each.
    pub fn with_capacity(dedup_capacity: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            dedup_capacity,
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id).map(JobStateStore::job)
    }

    /// Owned copy of every tracked job, for publishing.
    pub fn jobs(&self) -> HashMap<JobId, Job> {
        self.jobs
            .iter()
            .map(|(id, store)| (id.clone(), store.snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Stop tracking a job.
    pub fn remove(&mut self, job_id: &str) -> Option<Job> {
        self.jobs.remove(job_id).map(|store| store.snapshot())
    }

    /// Route a pushed update. Only [`Update::JobUpdate`] is meaningful on
    /// a shared stream; everything else is ignored.
    pub fn merge(&mut self, update: &Update) -> PatchOutcome {
        match update {
            Update::JobUpdate { job_id, patch } => self.apply_job_update(job_id, patch),
            Update::Heartbeat => PatchOutcome::default(),
            other => {
                tracing::debug!(kind = other.kind(), "Ignoring per-job frame on shared stream");
                PatchOutcome::default()
            }
        }
    }

    /// Apply a partial update, creating the job's store if needed.
    pub fn apply_job_update(&mut self, job_id: &str, patch: &JobPatch) -> PatchOutcome {
        self.apply_job_update_at(job_id, patch, Instant::now())
    }

    pub fn apply_job_update_at(
        &mut self,
        job_id: &str,
        patch: &JobPatch,
        now: Instant,
    ) -> PatchOutcome {
        let (store, created) = self.store_for(job_id);
        let mut outcome = PatchOutcome {
            changed: created,
            inconsistency: None,
        };

        match &patch.name {
            Patch::Set(name) => outcome.changed |= store.set_name(Some(name.clone()), now),
            Patch::Reset => outcome.changed |= store.set_name(None, now),
            Patch::Unchanged => {}
        }

        let started_at = patch.started_at.value().copied();
        let finished_at = patch.finished_at.value().copied();
        if matches!(patch.started_at, Patch::Reset) || matches!(patch.finished_at, Patch::Reset) {
            tracing::debug!(job_id, "Ignoring timestamp reset, timestamps are never cleared");
        }

        match &patch.status {
            Patch::Set(status) => {
                let update = Update::Status {
                    status: *status,
                    started_at,
                    finished_at,
                };
                match store.merge_at(&update, Origin::Push, now) {
                    MergeOutcome::Applied => outcome.changed = true,
                    MergeOutcome::Inconsistent(i) => outcome.inconsistency = Some(i),
                    _ => {}
                }
            }
            Patch::Reset | Patch::Unchanged => {
                if matches!(patch.status, Patch::Reset) {
                    tracing::debug!(job_id, "Ignoring status reset, status only moves forward");
                }
                outcome.changed |=
                    store.merge_timestamps(started_at, finished_at, Origin::Push, now);
            }
        }

        match &patch.progress {
            Patch::Set(value) => {
                outcome.changed |= store
                    .merge_at(&Update::Progress(*value), Origin::Push, now)
                    .is_applied();
            }
            Patch::Reset => outcome.changed |= store.reset_progress(now),
            Patch::Unchanged => {}
        }

        outcome
    }

    /// Reconcile a polled job listing. The listing is complete, so jobs
    /// missing from it are no longer tracked.
    pub fn seed(&mut self, snapshots: &[JobSnapshot], now: Instant) -> bool {
        let listed: HashSet<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        let gone: Vec<JobId> = self
            .jobs
            .keys()
            .filter(|id| !listed.contains(id.as_str()))
            .cloned()
            .collect();

        let mut changed = false;
        for job_id in gone {
            if self.remove(&job_id).is_some() {
                tracing::debug!(%job_id, "Job no longer listed");
                changed = true;
            }
        }
        for snapshot in snapshots {
            let (store, created) = self.store_for(&snapshot.id);
            changed |= created;
            changed |= store.apply_snapshot(snapshot, now).changed;
        }
        changed
    }

    fn store_for(&mut self, job_id: &str) -> (&mut JobStateStore, bool) {
        let created = !self.jobs.contains_key(job_id);
        if created {
            tracing::debug!(job_id, "Tracking new job");
        }
        let capacity = self.dedup_capacity;
        let store = self
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(|| JobStateStore::with_capacity(job_id, capacity));
        (store, created)
    }
}

impl Default for MultiJobAggregator {
    fn default() -> Self {
        Self::new()
    }
}
