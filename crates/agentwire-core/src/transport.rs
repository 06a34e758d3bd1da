//! Transport abstraction
//!
//! A [`Connector`] opens a [`Connection`]: a sink and a stream of [`Frame`]s.
//! The session never talks to a socket directly, which keeps the WebSocket
//! implementation swappable for the in-memory loopback used in tests.
//!
//! Everything written to a connection goes through one [`OutboundSender`]
//! queue. Text and binary frames share that queue so their relative order on
//! the wire is exactly the enqueue order.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::sink::Sink;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::warn;

use crate::error::{AgentError, Result};

/// Errors that can occur with transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport already running")]
    AlreadyRunning,

    #[error("Transport not running")]
    NotRunning,

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Control JSON
    Text(String),
    /// Raw speech audio, no envelope
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = BoxStream<'static, std::result::Result<Frame, TransportError>>;

/// An open connection. The stream ends when the peer closes.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections to the agent server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        access_token: &str,
    ) -> std::result::Result<Connection, TransportError>;
}

/// Enqueue side of the outbound queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Frame>,
}

/// Create the outbound queue; the receiver belongs to the writer task
pub fn outbound_queue(capacity: usize) -> (OutboundSender, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundSender { tx }, rx)
}

impl OutboundSender {
    /// Enqueue a frame, waiting at most `timeout` for space
    pub async fn queue(&self, frame: Frame, timeout: Duration) -> Result<()> {
        match self.tx.send_timeout(frame, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(frame)) => {
                warn!(len = frame.len(), "Outbound queue full, frame not sent");
                Err(AgentError::Timeout(format!(
                    "outbound queue full after {}ms",
                    timeout.as_millis()
                )))
            }
            Err(SendTimeoutError::Closed(_)) => Err(AgentError::Resource(
                "outbound queue is closed".to_string(),
            )),
        }
    }

    /// Enqueue a frame, waiting as long as it takes for space
    pub async fn queue_until_sent(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| AgentError::Resource("outbound queue is closed".to_string()))
    }
}

/// In-process connector. Every successful `connect` hands a [`MemoryPeer`]
/// to the matching [`MemoryAcceptor`].
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicBool>,
}

/// Receives the server side of each connection made through a [`MemoryConnector`]
pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server side of an in-memory connection
pub struct MemoryPeer {
    pub url: String,
    pub access_token: String,
    to_client: fmpsc::UnboundedSender<std::result::Result<Frame, TransportError>>,
    from_client: fmpsc::UnboundedReceiver<Frame>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                refuse: Arc::new(AtomicBool::new(false)),
            },
            MemoryAcceptor { peers: rx },
        )
    }

    /// Make subsequent connects fail with `ConnectFailed`
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        url: &str,
        access_token: &str,
    ) -> std::result::Result<Connection, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(format!(
                "{url}: connection refused"
            )));
        }

        let (client_tx, from_client) = fmpsc::unbounded::<Frame>();
        let (to_client, client_rx) = fmpsc::unbounded();

        let peer = MemoryPeer {
            url: url.to_string(),
            access_token: access_token.to_string(),
            to_client,
            from_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed(format!("{url}: no acceptor")))?;

        Ok(Connection {
            sink: Box::pin(client_tx.sink_map_err(|_| TransportError::Closed)),
            stream: client_rx.boxed(),
        })
    }
}

impl MemoryAcceptor {
    /// Wait for the next client connection
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

impl MemoryPeer {
    /// Next frame written by the client; `None` once the client side is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.next().await
    }

    /// Next text frame parsed as JSON, skipping binary frames
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        while let Some(frame) = self.recv().await {
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    pub fn send(&self, frame: Frame) -> std::result::Result<(), TransportError> {
        self.to_client
            .unbounded_send(Ok(frame))
            .map_err(|_| TransportError::Closed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> std::result::Result<(), TransportError> {
        self.send(Frame::Text(text.into()))
    }

    /// Deliver a transport error to the client's read loop
    pub fn fail(&self, error: TransportError) -> std::result::Result<(), TransportError> {
        self.to_client
            .unbounded_send(Err(error))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the server side; the client's stream ends
    pub fn close(self) {
        self.to_client.close_channel();
    }
}
