//! Periodic snapshot fetch used as seed and correctness backstop.
//!
//! A [`PollChannel`] fetches on a fixed interval regardless of push
//! health, and on demand through [`PollChannel::poll_now`]. Failures are
//! reported and retried at the next tick; they never stop the channel.
//! Results produced after [`PollChannel::stop`] (or after the owner's
//! token is cancelled) are discarded rather than delivered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use scanwatch_core::{JobId, JobSnapshot};

use crate::api::{PollOutcome, SnapshotSource};

/// Default interval between backstop polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What a poll channel fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    Job(JobId),
    /// The full job listing, for list views.
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Snapshot(PollOutcome),
    Listing(Vec<JobSnapshot>),
    Failed { error: String },
}

/// Fetch `target` once. Errors are logged and folded into
/// [`PollEvent::Failed`].
pub async fn fetch_once(source: &dyn SnapshotSource, target: &PollTarget) -> PollEvent {
    let result = match target {
        PollTarget::Job(job_id) => source.fetch_snapshot(job_id).await.map(PollEvent::Snapshot),
        PollTarget::All => source.fetch_all().await.map(PollEvent::Listing),
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(poll_target = ?target, error = %e, "Snapshot poll failed");
        PollEvent::Failed {
            error: e.to_string(),
        }
    })
}

/// Handle to a running poll loop.
pub struct PollChannel {
    wake: Arc<Notify>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollChannel {
    /// Start polling `target` every `interval`. The first scheduled poll
    /// happens one interval from now; seed fetches go through
    /// [`fetch_once`] directly.
    pub fn start(
        source: Arc<dyn SnapshotSource>,
        target: PollTarget,
        interval: Duration,
        events: mpsc::UnboundedSender<PollEvent>,
        parent: &CancellationToken,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let cancel = parent.child_token();
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(run_poll_loop(
            source,
            target,
            period,
            events,
            Arc::clone(&wake),
            cancel.clone(),
        ));

        Self {
            wake,
            cancel,
            task: Some(task),
        }
    }

    /// Request a poll ahead of schedule. Requests made while a fetch is
    /// in flight coalesce into one.
    pub fn poll_now(&self) {
        self.wake.notify_one();
    }

    /// Stop polling. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for PollChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_poll_loop(
    source: Arc<dyn SnapshotSource>,
    target: PollTarget,
    period: Duration,
    events: mpsc::UnboundedSender<PollEvent>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
            _ = wake.notified() => {
                tracing::debug!(poll_target = ?target, "Polling ahead of schedule");
                ticker.reset();
            }
        }

        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = fetch_once(source.as_ref(), &target) => event,
        };

        // Mount guard: a fetch that finished after teardown is discarded.
        if cancel.is_cancelled() || events.send(event).is_err() {
            return;
        }
    }
}
