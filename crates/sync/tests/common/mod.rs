#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as link;
use futures::StreamExt;
use tokio::sync::broadcast;

use scanwatch_core::{JobId, JobSnapshot, JobStatus, Timestamp};
use scanwatch_sync::api::ApiError;
use scanwatch_sync::client::{ClientError, FrameStream, PushAddress, PushConnector};
use scanwatch_sync::reconnect::ReconnectConfig;
use scanwatch_sync::{PollOutcome, SnapshotSource, SyncConfig, SyncEvent};

/// Server side of one fake push connection. Dropping it closes the
/// connection from the server end.
pub type ServerLink = link::UnboundedSender<String>;

/// Push connector whose connections are handed out in order. With no
/// connection queued, connecting fails.
#[derive(Default)]
pub struct FakeConnector {
    queued: Mutex<VecDeque<link::UnboundedReceiver<String>>>,
    addresses: Mutex<Vec<PushAddress>>,
    connects: AtomicU32,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let the next connect succeed.
    pub fn accept_next(&self) -> ServerLink {
        let (tx, rx) = link::unbounded();
        self.queued.lock().unwrap().push_back(rx);
        tx
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn addresses(&self) -> Vec<PushAddress> {
        self.addresses.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, address: &PushAddress) -> Result<FrameStream, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().unwrap().push(address.clone());
        match self.queued.lock().unwrap().pop_front() {
            Some(rx) => Ok(rx.map(Ok).boxed()),
            None => Err(ClientError::Connection("connection refused".into())),
        }
    }
}

/// Snapshot source backed by mutable in-memory state. `None` means the
/// job does not exist.
pub struct FakeSource {
    snapshot: Mutex<Option<JobSnapshot>>,
    listing: Mutex<Vec<JobSnapshot>>,
    failing: AtomicBool,
    calls: AtomicU32,
}

impl FakeSource {
    pub fn new(snapshot: Option<JobSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            listing: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        })
    }

    pub fn with_listing(listing: Vec<JobSnapshot>) -> Arc<Self> {
        let source = Self::new(None);
        *source.listing.lock().unwrap() = listing;
        source
    }

    pub fn update(&self, f: impl FnOnce(&mut JobSnapshot)) {
        if let Some(snapshot) = self.snapshot.lock().unwrap().as_mut() {
            f(snapshot);
        }
    }

    pub fn set_listing(&self, listing: Vec<JobSnapshot>) {
        *self.listing.lock().unwrap() = listing;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<(), ApiError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::ApiError {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch_snapshot(&self, _job_id: &JobId) -> Result<PollOutcome, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(match self.snapshot.lock().unwrap().clone() {
            Some(snapshot) => PollOutcome::Found(snapshot),
            None => PollOutcome::NotFound,
        })
    }

    async fn fetch_all(&self) -> Result<Vec<JobSnapshot>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.listing.lock().unwrap().clone())
    }
}

pub fn ts(rfc3339: &str) -> Timestamp {
    rfc3339.parse().unwrap()
}

/// A running job as the server reports it right after start.
pub fn running(job_id: &str) -> JobSnapshot {
    JobSnapshot {
        id: job_id.to_string(),
        name: None,
        status: JobStatus::Running,
        progress: 0,
        started_at: Some(ts("2026-03-01T10:00:00Z")),
        finished_at: None,
        output_log: vec![],
        targets: vec!["10.0.0.1".into()],
    }
}

/// Reference timings: 5s poll, 1s reconnect base with 5 attempts, 3s
/// quiet period.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        api_url: "http://scans.test/api".into(),
        ws_url: "ws://scans.test".into(),
        poll_interval: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        },
        quiescence_threshold: Duration::from_millis(3000),
        dedup_capacity: 1_000,
    }
}

pub fn send(link: &ServerLink, frame: &str) {
    link.unbounded_send(frame.to_string()).unwrap();
}

/// Fail the test instead of hanging when the paused clock keeps
/// advancing without the awaited condition ever holding.
pub async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(600), f)
        .await
        .expect("condition not reached in time")
}

/// Let spawned tasks run without advancing the clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Everything currently buffered on an event receiver.
pub fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn transitions(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::TransitionRequested))
        .count()
}

/// Wait for the next event matching `pred`.
pub async fn next_matching(
    events: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    within(async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
}
