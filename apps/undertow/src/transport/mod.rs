use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryAcceptor, MemoryConnector, memory_endpoint};
pub use websocket::{WebSocketConnector, WebSocketListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_transport_id() -> TransportId {
    TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Memory,
    WebSocket,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Memory => "memory",
            TransportKind::WebSocket => "websocket",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// One open bidirectional message channel. Each inbound item is one transport message,
/// which may hold several frames.
pub struct Link {
    sender: LinkSender,
    receiver: LinkReceiver,
}

impl Link {
    pub(crate) fn from_channels(
        kind: TransportKind,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        closed: CancellationToken,
    ) -> Self {
        let id = next_transport_id();
        Self {
            sender: LinkSender {
                id,
                kind,
                outbound,
                closed: closed.clone(),
            },
            receiver: LinkReceiver {
                id,
                inbound,
                closed,
            },
        }
    }

    pub fn id(&self) -> TransportId {
        self.sender.id
    }

    pub fn kind(&self) -> TransportKind {
        self.sender.kind
    }

    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.sender.send(bytes)
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn split(self) -> (LinkSender, LinkReceiver) {
        (self.sender, self.receiver)
    }
}

#[derive(Clone)]
pub struct LinkSender {
    id: TransportId,
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

impl LinkSender {
    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound
            .send(bytes)
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Closes both directions; the peer observes end-of-stream.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }
}

pub struct LinkReceiver {
    id: TransportId,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
}

impl LinkReceiver {
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// `None` once the transport closed, from either side.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            message = self.inbound.recv() => message,
            _ = self.closed.cancelled() => None,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link, TransportError>;

    fn describe(&self) -> String;
}

/// Two linked in-process ends, mostly for tests.
pub struct TransportPair {
    pub client: Link,
    pub server: Link,
}

impl TransportPair {
    pub fn new() -> Self {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        Self {
            client: Link::from_channels(TransportKind::Memory, client_tx, client_rx, closed.clone()),
            server: Link::from_channels(TransportKind::Memory, server_tx, server_rx, closed),
        }
    }
}

impl Default for TransportPair {
    fn default() -> Self {
        Self::new()
    }
}
