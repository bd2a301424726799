//! Push transport connector.
//!
//! [`PushConnector`] is the seam between the push channel and the wire.
//! [`WsConnector`] is the WebSocket implementation; tests substitute an
//! in-memory connector.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use scanwatch_core::JobId;

/// Text frames of one live connection. The stream ends when the
/// connection closes.
pub type FrameStream = BoxStream<'static, Result<String, ClientError>>;

/// What a push connection is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAddress {
    /// One job per connection (the running-scan view).
    Job(JobId),
    /// Every job visible to a consumer (the list view).
    Consumer(String),
}

impl PushAddress {
    /// Path appended to the WebSocket base URL.
    pub fn path(&self) -> String {
        match self {
            PushAddress::Job(job_id) => format!("/ws/scans/{job_id}"),
            PushAddress::Consumer(consumer) => format!("/ws/consumers/{consumer}"),
        }
    }
}

/// Opens push connections.
#[async_trait]
pub trait PushConnector: Send + Sync + 'static {
    async fn connect(&self, address: &PushAddress) -> Result<FrameStream, ClientError>;
}

/// WebSocket connector for the scan API.
pub struct WsConnector {
    ws_url: String,
}

impl WsConnector {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8000`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Full connection URL. A fresh `clientId` (UUID v4) lets the server
    /// address this specific connection.
    pub fn url_for(&self, address: &PushAddress, client_id: &str) -> String {
        format!(
            "{}{}?clientId={}",
            self.ws_url.trim_end_matches('/'),
            address.path(),
            client_id
        )
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, address: &PushAddress) -> Result<FrameStream, ClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = self.url_for(address, &client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ClientError::Connection(format!("Failed to connect to {}: {e}", self.ws_url))
        })?;

        tracing::info!(
            client_id = %client_id,
            path = %address.path(),
            "Connected to push endpoint at {}",
            self.ws_url,
        );

        Ok(text_frames(ws_stream))
    }
}

/// Reduce a WebSocket message stream to its text frames.
///
/// Binary frames are ignored, ping/pong is handled by tungstenite, and a
/// close frame ends the stream.
pub fn text_frames<S>(messages: S) -> FrameStream
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Send + 'static,
{
    messages
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(_)) => {
                    tracing::trace!("Ignoring binary push frame");
                    None
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Close(_)) => {
                    None
                }
                Err(e) => Some(Err(ClientError::Protocol(e.to_string()))),
            })
        })
        .boxed()
}

/// Errors that can occur on the push transport.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failed to establish the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
