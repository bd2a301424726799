//! Managed push connection with capped reconnect.
//!
//! [`PushChannel::open`] spawns a task that connects, parses frames into
//! [`Update`]s and forwards them as [`PushEvent`]s to a single receiver.
//! When the connection drops without [`PushChannel::close`] having been
//! called, it reconnects after `base * 2^attempt`; once the attempt cap
//! is exceeded it flags itself degraded and stops. Malformed frames are
//! logged and dropped inside the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use scanwatch_core::Update;

use crate::client::{FrameStream, PushAddress, PushConnector};
use crate::messages::parse_frame;
use crate::reconnect::{Backoff, ReconnectConfig};

/// Events delivered by a push channel, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    Frame(Update),
    /// The connection dropped without `close()` being called.
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted; the channel has stopped.
    Degraded,
}

/// Handle to a running push channel.
pub struct PushChannel {
    closed: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PushChannel {
    /// Start connecting to `address`. Events go to `events`; `parent`
    /// cancels the channel together with its owner.
    pub fn open(
        connector: Arc<dyn PushConnector>,
        address: PushAddress,
        config: ReconnectConfig,
        events: mpsc::UnboundedSender<PushEvent>,
        parent: &CancellationToken,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let degraded = Arc::new(AtomicBool::new(false));
        let cancel = parent.child_token();

        let task = tokio::spawn(run_channel(
            connector,
            address,
            config,
            events,
            cancel.clone(),
            Arc::clone(&degraded),
        ));

        Self {
            closed,
            degraded,
            cancel,
            task: Some(task),
        }
    }

    /// Close the channel on purpose. Idempotent; an intentional close
    /// never triggers a reconnect.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closing push channel");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reconnect attempts were exhausted.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Close and wait for the channel task to exit.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect -> pump frames -> back off, until closed or degraded.
async fn run_channel(
    connector: Arc<dyn PushConnector>,
    address: PushAddress,
    config: ReconnectConfig,
    events: mpsc::UnboundedSender<PushEvent>,
    cancel: CancellationToken,
    degraded: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::new(config);

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connector.connect(&address) => result,
        };

        match connected {
            Ok(frames) => {
                if events.send(PushEvent::Connected).is_err() {
                    return;
                }
                let healthy = pump_frames(frames, &events, &cancel).await;
                if cancel.is_cancelled() || events.is_closed() {
                    return;
                }
                if healthy {
                    backoff.reset();
                }
                tracing::warn!(path = %address.path(), "Push connection lost");
                if events.send(PushEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %address.path(),
                    attempt = backoff.attempt(),
                    error = %e,
                    "Push connect failed",
                );
            }
        }

        let Some(delay) = backoff.next_delay() else {
            tracing::error!(
                path = %address.path(),
                attempts = backoff.attempt(),
                "Reconnect attempts exhausted, falling back to polling",
            );
            degraded.store(true, Ordering::SeqCst);
            let _ = events.send(PushEvent::Degraded);
            return;
        };

        tracing::info!(
            path = %address.path(),
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting push channel",
        );
        let _ = events.send(PushEvent::Reconnecting {
            attempt: backoff.attempt(),
            delay,
        });

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Forward frames until the connection ends. Returns whether at least
/// one frame arrived, which marks the connection as healthy.
async fn pump_frames(
    mut frames: FrameStream,
    events: &mpsc::UnboundedSender<PushEvent>,
    cancel: &CancellationToken,
) -> bool {
    let mut healthy = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return healthy,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(text)) => {
                healthy = true;
                match parse_frame(&text) {
                    Ok(Update::Heartbeat) => {
                        tracing::trace!("Push heartbeat");
                        let _ = events.send(PushEvent::Frame(Update::Heartbeat));
                    }
                    Ok(update) => {
                        if events.send(PushEvent::Frame(update)).is_err() {
                            return healthy;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            raw_message = %text,
                            "Dropping malformed push frame",
                        );
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Push receive error");
                return healthy;
            }
            None => return healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::client::ClientError;

    /// Connector that hands out pre-scripted frame lists, then refuses.
    struct Scripted {
        sessions: std::sync::Mutex<Vec<Vec<&'static str>>>,
        connects: AtomicU32,
    }

    impl Scripted {
        fn new(sessions: Vec<Vec<&'static str>>) -> Arc<Self> {
            Arc::new(Self {
                sessions: std::sync::Mutex::new(sessions),
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PushConnector for Scripted {
        async fn connect(&self, _address: &PushAddress) -> Result<FrameStream, ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.is_empty() {
                return Err(ClientError::Connection("refused".into()));
            }
            let frames: Vec<Result<String, ClientError>> =
                sessions.remove(0).into_iter().map(|f| Ok(f.to_string())).collect();
            Ok(stream::iter(frames).boxed())
        }
    }

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_attempts: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped() {
        let connector = Scripted::new(vec![vec![
            r#"{"type":"progress","value":10}"#,
            "{broken",
            r#"{"type":"mystery"}"#,
            r#"{"type":"output","line":"ok"}"#,
        ]]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let channel = PushChannel::open(
            connector,
            PushAddress::Job("s".into()),
            fast_config(),
            tx,
            &root,
        );

        assert_eq!(rx.recv().await, Some(PushEvent::Connected));
        assert_eq!(rx.recv().await, Some(PushEvent::Frame(Update::Progress(10))));
        assert_eq!(
            rx.recv().await,
            Some(PushEvent::Frame(Update::Output("ok".into())))
        );
        assert_eq!(rx.recv().await, Some(PushEvent::Disconnected));
        channel.close();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_degrade_channel() {
        let connector = Scripted::new(vec![vec![]]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let channel = PushChannel::open(
            connector.clone(),
            PushAddress::Job("s".into()),
            fast_config(),
            tx,
            &root,
        );

        assert_eq!(rx.recv().await, Some(PushEvent::Connected));
        assert_eq!(rx.recv().await, Some(PushEvent::Disconnected));
        for attempt in 1..=5u32 {
            assert_matches!(
                rx.recv().await,
                Some(PushEvent::Reconnecting { attempt: a, delay })
                    if a == attempt && delay == Duration::from_millis(100 * 2u64.pow(attempt - 1))
            );
        }
        assert_eq!(rx.recv().await, Some(PushEvent::Degraded));
        assert_eq!(rx.recv().await, None);
        assert!(channel.is_degraded());
        // One initial connect plus five reconnect attempts.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_connection_resets_attempts() {
        let connector = Scripted::new(vec![
            vec![],
            vec![r#"{"type":"progress","value":1}"#],
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let _channel = PushChannel::open(
            connector,
            PushAddress::Job("s".into()),
            fast_config(),
            tx,
            &root,
        );

        assert_eq!(rx.recv().await, Some(PushEvent::Connected));
        assert_eq!(rx.recv().await, Some(PushEvent::Disconnected));
        assert_matches!(rx.recv().await, Some(PushEvent::Reconnecting { attempt: 1, .. }));
        assert_eq!(rx.recv().await, Some(PushEvent::Connected));
        assert_eq!(rx.recv().await, Some(PushEvent::Frame(Update::Progress(1))));
        assert_eq!(rx.recv().await, Some(PushEvent::Disconnected));
        // The frame proved the connection healthy, so counting restarts.
        assert_matches!(rx.recv().await, Some(PushEvent::Reconnecting { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn intentional_close_does_not_reconnect() {
        let connector = Scripted::new(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let channel = PushChannel::open(
            connector.clone(),
            PushAddress::Job("s".into()),
            fast_config(),
            tx,
            &root,
        );

        assert_matches!(rx.recv().await, Some(PushEvent::Reconnecting { attempt: 1, .. }));
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert_eq!(rx.recv().await, None);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(!channel.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_channel() {
        let connector = Scripted::new(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let _channel = PushChannel::open(
            connector,
            PushAddress::Job("s".into()),
            fast_config(),
            tx,
            &root,
        );
        root.cancel();
        while let Some(event) = rx.recv().await {
            assert_ne!(event, PushEvent::Degraded);
        }
    }
}
