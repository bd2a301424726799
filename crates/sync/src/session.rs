//! Scoped synchronization session for one job.
//!
//! [`ScanSession::spawn`] seeds the job with a poll, opens the push
//! channel, starts the backstop poll and then runs a single task that
//! owns the [`JobStateStore`] and [`QuiescenceDetector`]. Push frames,
//! poll results, quiescence ticks and consumer commands are all handled
//! on that task, one at a time, so no merge ever races another.
//!
//! The consumer reads state through the returned [`SessionHandle`].
//! Dropping the handle (or calling [`SessionHandle::shutdown`]) tears
//! everything down together: the push channel is closed intentionally,
//! both timers stop, and results arriving afterwards are discarded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use scanwatch_core::{Job, JobId};

use crate::api::{PollOutcome, SnapshotSource};
use crate::client::{PushAddress, PushConnector};
use crate::config::SyncConfig;
use crate::events::{LinkState, SyncEvent};
use crate::poll::{fetch_once, PollChannel, PollEvent, PollTarget};
use crate::push::{PushChannel, PushEvent};
use crate::quiescence::{Check, QuiescenceDetector};
use crate::store::{JobStateStore, MergeOutcome};

/// Broadcast channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Requests from a handle to its session task.
#[derive(Debug)]
pub(crate) enum Command {
    Reconnect,
}

/// State owned by the session task.
pub struct ScanSession {
    job_id: JobId,
    config: SyncConfig,
    connector: Arc<dyn PushConnector>,
    source: Arc<dyn SnapshotSource>,

    store: JobStateStore,
    detector: QuiescenceDetector,
    /// An opportunistic start-time poll is in flight.
    start_time_requested: bool,

    push: Option<PushChannel>,
    push_tx: mpsc::UnboundedSender<PushEvent>,
    poll: Option<PollChannel>,
    poll_tx: mpsc::UnboundedSender<PollEvent>,

    job_tx: watch::Sender<Job>,
    link_tx: watch::Sender<LinkState>,
    events_tx: broadcast::Sender<SyncEvent>,
    cancel: CancellationToken,
}

/// Consumer side of a running [`ScanSession`].
pub struct SessionHandle {
    job_id: JobId,
    job_rx: watch::Receiver<Job>,
    link_rx: watch::Receiver<LinkState>,
    events_tx: broadcast::Sender<SyncEvent>,
    first_events: Option<broadcast::Receiver<SyncEvent>>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inbox {
    push_rx: mpsc::UnboundedReceiver<PushEvent>,
    poll_rx: mpsc::UnboundedReceiver<PollEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl ScanSession {
    /// Start monitoring `job_id`. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: SyncConfig,
        job_id: impl Into<JobId>,
        connector: Arc<dyn PushConnector>,
        source: Arc<dyn SnapshotSource>,
    ) -> SessionHandle {
        let job_id = job_id.into();
        let store = JobStateStore::with_capacity(job_id.clone(), config.dedup_capacity);

        let (job_tx, job_rx) = watch::channel(store.snapshot());
        let (link_tx, link_rx) = watch::channel(LinkState::Connecting);
        let (events_tx, first_events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session = ScanSession {
            job_id: job_id.clone(),
            config,
            connector,
            source,
            store,
            detector: QuiescenceDetector::new(),
            start_time_requested: false,
            push: None,
            push_tx,
            poll: None,
            poll_tx,
            job_tx,
            link_tx,
            events_tx: events_tx.clone(),
            cancel: cancel.clone(),
        };
        let inbox = Inbox {
            push_rx,
            poll_rx,
            commands: command_rx,
        };

        let task = tokio::spawn(session.run(inbox));

        SessionHandle {
            job_id,
            job_rx,
            link_rx,
            events_tx,
            first_events: Some(first_events),
            commands: command_tx,
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self, mut inbox: Inbox) {
        tracing::info!(job_id = %self.job_id, "Starting scan session");

        let target = PollTarget::Job(self.job_id.clone());
        let seed = tokio::select! {
            _ = self.cancel.cancelled() => return,
            event = fetch_once(self.source.as_ref(), &target) => event,
        };
        self.on_poll(seed);

        if !self.is_finished() {
            self.open_push();
            self.poll = Some(PollChannel::start(
                Arc::clone(&self.source),
                target,
                self.config.poll_interval,
                self.poll_tx.clone(),
                &self.cancel,
            ));
        }

        while !self.is_finished() {
            let deadline = self
                .detector
                .deadline(self.store.job().last_update_at, Instant::now());

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = inbox.commands.recv() => self.on_command(command),
                Some(event) = inbox.push_rx.recv() => self.on_push(event),
                Some(event) = inbox.poll_rx.recv() => self.on_poll(event),
                _ = wait_until(deadline) => self.check_quiescence(),
            }
        }

        self.teardown();
    }

    fn is_finished(&self) -> bool {
        self.detector.has_transitioned() || self.store.is_not_found()
    }

    // ---- inbound events ----

    fn on_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Connected => {
                self.set_link(LinkState::Live);
                self.emit(SyncEvent::Connected);
            }
            PushEvent::Frame(update) => {
                let outcome = self.store.merge(&update);
                self.after_merge(outcome);
            }
            PushEvent::Disconnected => {
                self.emit(SyncEvent::Disconnected);
                // The server closes the stream once a finished job has
                // flushed its output; no need to wait out the quiet period.
                if self.store.is_terminal() {
                    self.arm_transition();
                    self.detector.fire_now();
                }
            }
            PushEvent::Reconnecting { attempt, delay } => {
                self.set_link(LinkState::Reconnecting { attempt });
                self.emit(SyncEvent::Reconnecting { attempt, delay });
            }
            PushEvent::Degraded => {
                tracing::warn!(job_id = %self.job_id, "Push degraded, continuing with polling only");
                self.set_link(LinkState::Degraded);
                self.emit(SyncEvent::Degraded);
            }
        }
    }

    fn on_poll(&mut self, event: PollEvent) {
        match event {
            PollEvent::Snapshot(PollOutcome::Found(snapshot)) => {
                self.start_time_requested = false;
                let outcome = self.store.apply_snapshot(&snapshot, Instant::now());
                for inconsistency in outcome.inconsistencies {
                    self.emit(SyncEvent::Inconsistency(inconsistency));
                }
                if outcome.changed {
                    self.publish();
                }
                self.after_change();
            }
            PollEvent::Snapshot(PollOutcome::NotFound) => {
                if self.store.mark_not_found() {
                    self.emit(SyncEvent::NotFound);
                    self.publish();
                }
            }
            PollEvent::Listing(_) => {
                tracing::debug!(job_id = %self.job_id, "Ignoring job listing in single-job session");
            }
            PollEvent::Failed { error } => {
                self.start_time_requested = false;
                self.emit(SyncEvent::PollFailed { error });
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Reconnect => {
                let live = self.push.as_ref().is_some_and(|p| !p.is_degraded());
                if live {
                    tracing::debug!(job_id = %self.job_id, "Reconnect requested while push is active");
                    return;
                }
                tracing::info!(job_id = %self.job_id, "Manually resuming push channel");
                self.open_push();
            }
        }
    }

    fn check_quiescence(&mut self) {
        let check = self
            .detector
            .check(self.store.job().last_update_at, Instant::now());
        if let Check::Wait(remaining) = check {
            tracing::trace!(
                job_id = %self.job_id,
                remaining_ms = remaining.as_millis() as u64,
                "Still receiving updates, deferring transition",
            );
        }
    }

    // ---- helpers ----

    fn after_merge(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.publish(),
            MergeOutcome::Inconsistent(inconsistency) => {
                self.emit(SyncEvent::Inconsistency(inconsistency));
            }
            _ => {}
        }
        self.after_change();
    }

    fn after_change(&mut self) {
        if self.store.is_terminal() {
            self.arm_transition();
        }
        if self.store.needs_start_time() && !self.start_time_requested {
            if let Some(poll) = &self.poll {
                tracing::debug!(job_id = %self.job_id, "Progress without start time, polling");
                self.start_time_requested = true;
                poll.poll_now();
            }
        }
    }

    fn arm_transition(&mut self) {
        let events = self.events_tx.clone();
        let job_id = self.job_id.clone();
        self.detector
            .arm_transition(self.config.quiescence_threshold, move || {
                tracing::info!(job_id = %job_id, "Transition requested");
                let _ = events.send(SyncEvent::TransitionRequested);
            });
    }

    fn open_push(&mut self) {
        self.set_link(LinkState::Connecting);
        self.push = Some(PushChannel::open(
            Arc::clone(&self.connector),
            PushAddress::Job(self.job_id.clone()),
            self.config.reconnect,
            self.push_tx.clone(),
            &self.cancel,
        ));
    }

    fn publish(&self) {
        self.job_tx.send_replace(self.store.snapshot());
    }

    fn set_link(&self, state: LinkState) {
        self.link_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn teardown(&mut self) {
        if let Some(push) = self.push.take() {
            push.close();
        }
        if let Some(poll) = self.poll.take() {
            poll.stop();
        }
        self.set_link(LinkState::Closed);
        tracing::info!(
            job_id = %self.job_id,
            status = %self.store.job().status,
            not_found = self.store.is_not_found(),
            "Scan session ended",
        );
    }
}

/// Resolve at `deadline`, or never when there is none.
pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Current merged job.
    pub fn job(&self) -> Job {
        self.job_rx.borrow().clone()
    }

    /// Notified on every accepted merge.
    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.job_rx.clone()
    }

    /// Session events. The first call returns a receiver holding every
    /// event since the session was spawned; later calls only see new ones.
    pub fn events(&mut self) -> broadcast::Receiver<SyncEvent> {
        self.first_events
            .take()
            .unwrap_or_else(|| self.events_tx.subscribe())
    }

    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_rx.borrow()
    }

    /// Push reconnects are exhausted and only polling keeps state fresh.
    pub fn is_degraded(&self) -> bool {
        self.link_state().is_degraded()
    }

    /// Re-open a degraded push channel with a fresh attempt counter.
    /// Returns `false` if the session has already ended.
    pub fn reconnect(&self) -> bool {
        self.commands.send(Command::Reconnect).is_ok()
    }

    /// The session task has exited (transitioned, not found, or torn down).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the session to end on its own.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }

    /// Tear the session down and wait for its task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
