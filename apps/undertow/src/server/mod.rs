//! Server session host: handshake validation, resume window, windowed patch delivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod counter;
pub mod registry;
pub mod session;
pub mod token;
pub mod view;

pub use registry::{Accepted, SessionRegistry, SharedSession};
pub use session::{SessionOutput, SessionState};
pub use token::{TokenError, TokenIssuer};
pub use view::{View, ViewError, ViewFactory};

use crate::config::Config;
use crate::metrics;
use crate::protocol::{
    ClientMessage, Control, FrameReader, RejectReason, ServerHello, ServerMessage, WireError,
    decode_client_message, encode_server_message,
};
use crate::transport::memory::MemoryAcceptor;
use crate::transport::websocket::WebSocketListener;
use crate::transport::{Link, LinkReceiver, LinkSender, TransportError};

pub const DEFAULT_SECRET: &str = "undertow-development-secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// How long a detached session may be resumed.
    pub resume_window: Duration,
    pub max_sessions: usize,
    /// HMAC key for anti-forgery tokens.
    pub secret: String,
    pub min_protocol_minor: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            resume_window: Duration::from_secs(60),
            max_sessions: 1_024,
            secret: DEFAULT_SECRET.into(),
            min_protocol_minor: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Accepts links and runs one session task per link.
#[derive(Clone)]
pub struct ServerHost {
    registry: Arc<SessionRegistry>,
    max_message_bytes: usize,
    handshake_timeout: Duration,
}

impl ServerHost {
    pub fn new(config: &Config, factory: ViewFactory) -> Self {
        if config.server.secret == DEFAULT_SECRET {
            warn!(target = "undertow::server", "using the built-in development secret for anti-forgery tokens");
        }
        Self {
            registry: Arc::new(SessionRegistry::new(config.server.clone(), factory)),
            max_message_bytes: config.limits.max_message_bytes,
            handshake_timeout: config.connection.handshake_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn serve_websocket(
        &self,
        listener: WebSocketListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let mut sweep = tokio::time::interval(self.sweep_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => { self.registry.expire(Instant::now()); }
                accepted = listener.accept() => match accepted {
                    Ok(link) => self.spawn_link(link),
                    Err(err) => warn!(target = "undertow::server", error = %err, "failed to accept websocket"),
                },
            }
        }
        info!(target = "undertow::server", "listener stopped");
        Ok(())
    }

    pub async fn serve_memory(&self, mut acceptor: MemoryAcceptor, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(self.sweep_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => { self.registry.expire(Instant::now()); }
                accepted = acceptor.accept() => match accepted {
                    Some(link) => self.spawn_link(link),
                    None => break,
                },
            }
        }
    }

    fn sweep_interval(&self) -> Duration {
        (self.registry.config().resume_window / 2).max(Duration::from_millis(100))
    }

    fn spawn_link(&self, link: Link) {
        let host = self.clone();
        tokio::spawn(async move {
            let id = link.id();
            if let Err(err) = host.serve_link(link).await {
                debug!(target = "undertow::server", link = %id, error = %err, "link ended with error");
            }
        });
    }

    /// Runs the handshake and then the session loop until the link closes.
    pub async fn serve_link(&self, link: Link) -> Result<(), ServerError> {
        let link_id = link.id();
        let (sender, mut receiver) = link.split();
        let mut inbox = Inbox::new(self.max_message_bytes);

        let hello = match timeout(self.handshake_timeout, inbox.next(&mut receiver)).await {
            Err(_) => {
                debug!(target = "undertow::server", link = %link_id, "handshake timed out");
                sender.close();
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Ok(Some(Ok(ClientMessage::Hello(hello)))) => hello,
            Ok(Some(other)) => {
                debug!(target = "undertow::server", link = %link_id, first = ?other.map(|m| m.label()), "expected hello");
                self.reject(&sender, RejectReason::MalformedRequest);
                return Ok(());
            }
        };

        let accepted = match self.registry.handshake(&hello, Instant::now()) {
            Ok(accepted) => accepted,
            Err(reason) => {
                info!(target = "undertow::server", link = %link_id, reason = %reason, "handshake rejected");
                self.reject(&sender, reason);
                return Ok(());
            }
        };
        let session_id = accepted.hello.session_id.clone();
        transmit(&sender, &ServerMessage::ServerHello(accepted.hello))?;
        for message in &accepted.initial {
            transmit(&sender, message)?;
        }

        let mut goodbye = false;
        let result = loop {
            let Some(next) = inbox.next(&mut receiver).await else {
                break Ok(());
            };
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    warn!(target = "undertow::server", session = %session_id, error = %err, "dropping malformed frame");
                    continue;
                }
            };
            goodbye = matches!(message, ClientMessage::Control(Control::Goodbye { .. }));
            let output = accepted.session.lock().on_message(message);
            if let Err(err) = output
                .messages
                .iter()
                .try_for_each(|message| transmit(&sender, message))
            {
                break Err(err.into());
            }
            if output.close {
                break Ok(());
            }
        };

        sender.close();
        if goodbye {
            self.registry.remove(&session_id);
        } else {
            self.registry.detach(&session_id, Instant::now());
        }
        debug!(target = "undertow::server", session = %session_id, goodbye, "link closed");
        result
    }

    fn reject(&self, sender: &LinkSender, reason: RejectReason) {
        let hello = ServerHello::rejected(reason, crate::protocol::unix_time_ms());
        if let Err(err) = transmit(sender, &ServerMessage::ServerHello(hello)) {
            debug!(target = "undertow::server", error = %err, "peer gone before rejection");
        }
        sender.close();
    }
}

fn transmit(sender: &LinkSender, message: &ServerMessage) -> Result<(), TransportError> {
    metrics::FRAMES_OUT.with_label_values(&[message.label()]).inc();
    sender.send(encode_server_message(message))
}

/// Reassembles frames from transport messages and decodes them in arrival order.
struct Inbox {
    reader: FrameReader,
    ready: VecDeque<Result<ClientMessage, WireError>>,
}

impl Inbox {
    fn new(max_message_bytes: usize) -> Self {
        Self {
            reader: FrameReader::new(max_message_bytes),
            ready: VecDeque::new(),
        }
    }

    async fn next(
        &mut self,
        receiver: &mut LinkReceiver,
    ) -> Option<Result<ClientMessage, WireError>> {
        loop {
            if let Some(next) = self.ready.pop_front() {
                return Some(next);
            }
            let bytes = receiver.recv().await?;
            for frame in self.reader.feed(&bytes) {
                let decoded = frame.and_then(|frame| decode_client_message(&frame));
                match &decoded {
                    Ok(message) => metrics::FRAMES_IN.with_label_values(&[message.label()]).inc(),
                    Err(_) => metrics::DECODE_FAILURES.inc(),
                }
                self.ready.push_back(decoded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Ack, ClientEvent, EventKind, Hello, HandshakeStatus, NodeRef, PROTOCOL_MAJOR,
        PROTOCOL_MINOR, Viewport, decode_server_bytes, encode_client_message,
    };
    use crate::server::counter::CounterView;
    use crate::transport::TransportPair;

    fn host() -> ServerHost {
        let mut config = Config::default();
        config.server.secret = "unit-secret".into();
        ServerHost::new(&config, Arc::new(|| Box::new(CounterView::new())))
    }

    fn hello(host: &ServerHost) -> ClientMessage {
        ClientMessage::Hello(Hello {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            anti_forgery_token: host.registry().tokens().issue().expect("token"),
            resume_session_id: None,
            last_seq: 0,
            viewport: Viewport::default(),
            tz_offset_minutes: 60,
        })
    }

    async fn recv(link: &mut Link) -> ServerMessage {
        let bytes = link.recv().await.expect("message");
        decode_server_bytes(&bytes).expect("decode")
    }

    #[test_timeout::tokio_timeout_test]
    async fn accepts_then_answers_events_with_batches() {
        let host = host();
        let TransportPair { mut client, server } = TransportPair::new();
        let task = tokio::spawn({
            let host = host.clone();
            async move { host.serve_link(server).await }
        });

        client.send(encode_client_message(&hello(&host))).expect("hello");
        let ServerMessage::ServerHello(reply) = recv(&mut client).await else {
            panic!("expected server hello");
        };
        assert_eq!(reply.status, HandshakeStatus::Accepted);
        assert!(reply.full_state_follows());
        assert!(matches!(
            recv(&mut client).await,
            ServerMessage::Control(Control::FullResync { .. })
        ));

        let click = ClientMessage::Event(ClientEvent {
            seq: 1,
            node: NodeRef::from("inc"),
            kind: EventKind::Click { x: 0, y: 0 },
        });
        client.send(encode_client_message(&click)).expect("event");
        let ServerMessage::Patches(batch) = recv(&mut client).await else {
            panic!("expected patches");
        };
        assert_eq!(batch.seq, 1);
        client
            .send(encode_client_message(&ClientMessage::Ack(Ack {
                last_seq: 1,
                window: 16,
            })))
            .expect("ack");

        client
            .send(encode_client_message(&ClientMessage::Control(Control::Goodbye {
                reason: "done".into(),
            })))
            .expect("goodbye");
        task.await.expect("join").expect("serve");
        assert!(host.registry().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn non_hello_first_frame_is_malformed() {
        let host = host();
        let TransportPair { mut client, server } = TransportPair::new();
        let task = tokio::spawn({
            let host = host.clone();
            async move { host.serve_link(server).await }
        });
        client
            .send(encode_client_message(&ClientMessage::Control(Control::Ping {
                timestamp_ms: 1,
            })))
            .expect("send");
        let ServerMessage::ServerHello(reply) = recv(&mut client).await else {
            panic!("expected server hello");
        };
        assert_eq!(
            reply.status,
            HandshakeStatus::Rejected(RejectReason::MalformedRequest)
        );
        task.await.expect("join").expect("serve");
        assert_eq!(client.recv().await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_link_keeps_session_for_resume() {
        let host = host();
        let TransportPair { client, server } = TransportPair::new();
        let task = tokio::spawn({
            let host = host.clone();
            async move { host.serve_link(server).await }
        });
        client.send(encode_client_message(&hello(&host))).expect("hello");
        let mut client = client;
        recv(&mut client).await;
        client.close();
        task.await.expect("join").expect("serve");
        assert_eq!(host.registry().len(), 1);
    }
}
