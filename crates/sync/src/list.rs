//! Scoped synchronization session for a list of jobs.
//!
//! One push connection addressed by consumer identity carries partial
//! updates for every job in the list. A [`ListSession`] routes them into
//! a [`MultiJobAggregator`] and reconciles the full listing on the same
//! backstop interval as single-job sessions. List views never transition,
//! so there is no quiescence tracking here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use scanwatch_core::{Job, JobId};

use crate::aggregator::MultiJobAggregator;
use crate::api::SnapshotSource;
use crate::client::{PushAddress, PushConnector};
use crate::config::SyncConfig;
use crate::events::{LinkState, SyncEvent};
use crate::poll::{fetch_once, PollChannel, PollEvent, PollTarget};
use crate::push::{PushChannel, PushEvent};
use crate::session::Command;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub type JobMap = HashMap<JobId, Job>;

/// State owned by the list session task.
pub struct ListSession {
    consumer: String,
    config: SyncConfig,
    connector: Arc<dyn PushConnector>,
    source: Arc<dyn SnapshotSource>,
    aggregator: MultiJobAggregator,

    push: Option<PushChannel>,
    push_tx: mpsc::UnboundedSender<PushEvent>,
    poll: Option<PollChannel>,

    jobs_tx: watch::Sender<JobMap>,
    link_tx: watch::Sender<LinkState>,
    events_tx: broadcast::Sender<SyncEvent>,
    cancel: CancellationToken,
}

/// Consumer side of a running [`ListSession`].
pub struct ListHandle {
    jobs_rx: watch::Receiver<JobMap>,
    link_rx: watch::Receiver<LinkState>,
    events_tx: broadcast::Sender<SyncEvent>,
    first_events: Option<broadcast::Receiver<SyncEvent>>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ListSession {
    /// Start tracking every job visible to `consumer`.
    pub fn spawn(
        config: SyncConfig,
        consumer: impl Into<String>,
        connector: Arc<dyn PushConnector>,
        source: Arc<dyn SnapshotSource>,
    ) -> ListHandle {
        let (jobs_tx, jobs_rx) = watch::channel(JobMap::new());
        let (link_tx, link_rx) = watch::channel(LinkState::Connecting);
        let (events_tx, first_events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session = ListSession {
            consumer: consumer.into(),
            aggregator: MultiJobAggregator::with_capacity(config.dedup_capacity),
            config,
            connector,
            source,
            push: None,
            push_tx,
            poll: None,
            jobs_tx,
            link_tx,
            events_tx: events_tx.clone(),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(session.run(push_rx, command_rx));

        ListHandle {
            jobs_rx,
            link_rx,
            events_tx,
            first_events: Some(first_events),
            commands: command_tx,
            cancel,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut push_rx: mpsc::UnboundedReceiver<PushEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        tracing::info!(consumer = %self.consumer, "Starting list session");

        let seed = tokio::select! {
            _ = self.cancel.cancelled() => return,
            event = fetch_once(self.source.as_ref(), &PollTarget::All) => event,
        };
        self.on_poll(seed);

        let (poll_tx, mut poll_rx) = mpsc::unbounded_channel();
        self.open_push();
        self.poll = Some(PollChannel::start(
            Arc::clone(&self.source),
            PollTarget::All,
            self.config.poll_interval,
            poll_tx,
            &self.cancel,
        ));

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => self.on_command(command),
                Some(event) = push_rx.recv() => self.on_push(event),
                Some(event) = poll_rx.recv() => self.on_poll(event),
            }
        }

        if let Some(push) = self.push.take() {
            push.close();
        }
        if let Some(poll) = self.poll.take() {
            poll.stop();
        }
        self.set_link(LinkState::Closed);
        tracing::info!(
            consumer = %self.consumer,
            jobs = self.aggregator.len(),
            "List session ended",
        );
    }

    fn on_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Connected => {
                self.set_link(LinkState::Live);
                self.emit(SyncEvent::Connected);
            }
            PushEvent::Frame(update) => {
                let outcome = self.aggregator.merge(&update);
                if let Some(inconsistency) = outcome.inconsistency {
                    self.emit(SyncEvent::Inconsistency(inconsistency));
                }
                if outcome.changed {
                    self.publish();
                }
            }
            PushEvent::Disconnected => self.emit(SyncEvent::Disconnected),
            PushEvent::Reconnecting { attempt, delay } => {
                self.set_link(LinkState::Reconnecting { attempt });
                self.emit(SyncEvent::Reconnecting { attempt, delay });
            }
            PushEvent::Degraded => {
                tracing::warn!(consumer = %self.consumer, "List push degraded, polling only");
                self.set_link(LinkState::Degraded);
                self.emit(SyncEvent::Degraded);
            }
        }
    }

    fn on_poll(&mut self, event: PollEvent) {
        match event {
            PollEvent::Listing(snapshots) => {
                if self.aggregator.seed(&snapshots, Instant::now()) {
                    self.publish();
                }
            }
            PollEvent::Snapshot(_) => {
                tracing::debug!(consumer = %self.consumer, "Ignoring single-job snapshot");
            }
            PollEvent::Failed { error } => self.emit(SyncEvent::PollFailed { error }),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Reconnect => {
                if self.push.as_ref().is_some_and(|p| !p.is_degraded()) {
                    return;
                }
                tracing::info!(consumer = %self.consumer, "Manually resuming list push channel");
                self.open_push();
            }
        }
    }

    fn open_push(&mut self) {
        self.set_link(LinkState::Connecting);
        self.push = Some(PushChannel::open(
            Arc::clone(&self.connector),
            PushAddress::Consumer(self.consumer.clone()),
            self.config.reconnect,
            self.push_tx.clone(),
            &self.cancel,
        ));
    }

    fn publish(&self) {
        self.jobs_tx.send_replace(self.aggregator.jobs());
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
        let _ = self.events_tx.send(event);
    }
}

impl ListHandle {
    /// Every tracked job.
    pub fn jobs(&self) -> JobMap {
        self.jobs_rx.borrow().clone()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.jobs_rx.borrow().get(job_id).cloned()
    }

    /// Notified whenever any job in the list changes.
    pub fn subscribe(&self) -> watch::Receiver<JobMap> {
        self.jobs_rx.clone()
    }

    /// See [`SessionHandle::events`](crate::session::SessionHandle::events).
    pub fn events(&mut self) -> broadcast::Receiver<SyncEvent> {
        self.first_events
            .take()
            .unwrap_or_else(|| self.events_tx.subscribe())
    }

    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.link_rx.borrow().is_degraded()
    }

    pub fn reconnect(&self) -> bool {
        self.commands.send(Command::Reconnect).is_ok()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for ListHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
