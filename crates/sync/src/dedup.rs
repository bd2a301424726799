//! Content-based idempotence guard for inbound updates.
//!
//! Each job owns one [`DedupFilter`]. It remembers a bounded window of
//! fingerprints of content already accepted, so the same message
//! delivered twice (push replay, or a poll snapshot restating a pushed
//! line) is applied only once.

use std::collections::{HashSet, VecDeque};

use scanwatch_core::job::clamp_progress;
use scanwatch_core::{JobStatus, Update};

/// Default number of fingerprints remembered per job.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Identity of an update's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Status(JobStatus),
    Progress(u8),
    Output(String),
}

impl Fingerprint {
    /// Fingerprint of an update, or `None` for updates that carry no
    /// per-job content of their own.
    pub fn of(update: &Update) -> Option<Self> {
        match update {
            Update::Status { status, .. } => Some(Fingerprint::Status(*status)),
            Update::Progress(value) => Some(Fingerprint::Progress(clamp_progress(*value))),
            Update::Output(line) => Some(Fingerprint::Output(line.clone())),
            Update::Heartbeat | Update::JobUpdate { .. } => None,
        }
    }
}

/// Bounded per-job set of seen fingerprints, evicted oldest-first.
#[derive(Debug)]
pub struct DedupFilter {
    capacity: usize,
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
}

impl DedupFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Decide whether an update carries content not seen before.
    ///
    /// Heartbeats are always rejected. Partial job updates are passed
    /// through: their fields are fingerprinted individually by the
    /// per-job store they are routed to.
    pub fn accept(&mut self, update: &Update) -> bool {
        match update {
            Update::Heartbeat => false,
            Update::JobUpdate { .. } => true,
            _ => match Fingerprint::of(update) {
                Some(fp) => self.insert(fp),
                None => false,
            },
        }
    }

    /// Drop every remembered fingerprint.
    pub fn evict(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    /// Forget progress fingerprints so a reset progress can climb again.
    pub fn forget_progress(&mut self) {
        self.seen
            .retain(|fp| !matches!(fp, Fingerprint::Progress(_)));
        self.order
            .retain(|fp| !matches!(fp, Fingerprint::Progress(_)));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn insert(&mut self, fp: Fingerprint) -> bool {
        if self.seen.contains(&fp) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(fp.clone());
        self.seen.insert(fp);
        true
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanwatch_core::JobPatch;

    #[test]
    fn heartbeat_is_always_rejected() {
        let mut filter = DedupFilter::default();
        assert!(!filter.accept(&Update::Heartbeat));
        assert!(!filter.accept(&Update::Heartbeat));
        assert!(filter.is_empty());
    }

    #[test]
    fn duplicate_output_line_is_rejected() {
        let mut filter = DedupFilter::default();
        let line = Update::Output("Discovered port 80".into());
        assert!(filter.accept(&line));
        assert!(!filter.accept(&line));
        assert!(filter.accept(&Update::Output("Discovered port 443".into())));
    }

    #[test]
    fn status_fingerprint_ignores_timestamps() {
        let mut filter = DedupFilter::default();
        assert!(filter.accept(&Update::status(JobStatus::Running)));
        let with_time = Update::Status {
            status: JobStatus::Running,
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
        };
        assert!(!filter.accept(&with_time));
    }

    #[test]
    fn progress_fingerprint_uses_clamped_value() {
        let mut filter = DedupFilter::default();
        assert!(filter.accept(&Update::Progress(100)));
        assert!(!filter.accept(&Update::Progress(150)));
    }

    #[test]
    fn same_value_different_kind_is_distinct() {
        let mut filter = DedupFilter::default();
        assert!(filter.accept(&Update::Progress(80)));
        assert!(filter.accept(&Update::Output("80".into())));
    }

    #[test]
    fn job_updates_pass_through() {
        let mut filter = DedupFilter::default();
        let update = Update::JobUpdate {
            job_id: "a".into(),
            patch: JobPatch::default(),
        };
        assert!(filter.accept(&update));
        assert!(filter.accept(&update));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut filter = DedupFilter::new(2);
        assert!(filter.accept(&Update::Output("a".into())));
        assert!(filter.accept(&Update::Output("b".into())));
        assert!(filter.accept(&Update::Output("c".into())));
        assert_eq!(filter.len(), 2);
        // "a" fell out of the window, "c" is still remembered.
        assert!(filter.accept(&Update::Output("a".into())));
        assert!(!filter.accept(&Update::Output("c".into())));
    }

    #[test]
    fn evict_clears_everything() {
        let mut filter = DedupFilter::default();
        filter.accept(&Update::Output("a".into()));
        filter.accept(&Update::Progress(10));
        filter.evict();
        assert!(filter.is_empty());
        assert!(filter.accept(&Update::Output("a".into())));
    }

    #[test]
    fn forget_progress_keeps_other_fingerprints() {
        let mut filter = DedupFilter::default();
        filter.accept(&Update::Output("a".into()));
        filter.accept(&Update::Progress(10));
        filter.forget_progress();
        assert!(filter.accept(&Update::Progress(10)));
        assert!(!filter.accept(&Update::Output("a".into())));
    }
}
