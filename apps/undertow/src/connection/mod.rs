//! Connection lifecycle: handshake, heartbeat and reconnect policy.
//!
//! [`ConnectionManager`] performs no I/O. Each input returns the actions the caller must
//! carry out (open a transport, transmit a message, arm a timer), which keeps every
//! transition testable without sockets or clocks.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{
    ClientMessage, HandshakeStatus, Hello, PROTOCOL_MAJOR, PROTOCOL_MINOR, RejectReason,
    ServerHello, Viewport,
};

pub mod backoff;
pub mod queue;

pub use backoff::BackoffPolicy;
pub use queue::{DEFAULT_QUEUE_LIMIT, OutboundQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub anti_forgery_token: String,
    pub viewport: Viewport,
    pub tz_offset_minutes: i16,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub queue_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            anti_forgery_token: String::new(),
            viewport: Viewport::default(),
            tz_offset_minutes: 0,
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("outbound queue is full ({limit} messages)")]
    QueueFull { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a new transport and report back via `on_transport_open`/`on_transport_closed`.
    Open,
    Transmit(ClientMessage),
    StartHandshakeTimer(Duration),
    StartHeartbeat(Duration),
    ScheduleRetry(Duration),
    Accepted {
        session_id: String,
        next_seq: u32,
        resumed: bool,
        full_state_follows: bool,
    },
    Rejected(RejectReason),
    GaveUp { attempts: u32 },
    Close,
    /// Cancel handshake, heartbeat and retry timers.
    CancelTimers,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    state: ConnectionState,
    session_id: Option<String>,
    attempt: u32,
    awaiting_hello: bool,
    queue: OutboundQueue,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let queue = OutboundQueue::new(config.queue_limit);
        Self {
            config,
            state: ConnectionState::Disconnected,
            session_id: None,
            attempt: 0,
            awaiting_hello: false,
            queue,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_awaiting_hello(&self) -> bool {
        self.awaiting_hello
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    pub fn start(&mut self) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Disconnected => {
                self.attempt = 0;
                self.transition(ConnectionState::Connecting);
                vec![ConnectionAction::Open]
            }
            _ => Vec::new(),
        }
    }

    /// The transport opened; sends Hello carrying the resume id and `last_seq`.
    pub fn on_transport_open(&mut self, last_seq: u32) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            warn!(
                target = "undertow::connection",
                state = self.state.as_str(),
                "transport opened outside of connecting state"
            );
            return vec![ConnectionAction::Close];
        }
        self.awaiting_hello = true;
        let hello = Hello {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            anti_forgery_token: self.config.anti_forgery_token.clone(),
            resume_session_id: self.session_id.clone(),
            last_seq,
            viewport: self.config.viewport,
            tz_offset_minutes: self.config.tz_offset_minutes,
        };
        debug!(
            target = "undertow::connection",
            resume = self.session_id.as_deref().unwrap_or(""),
            last_seq,
            "sending hello"
        );
        vec![
            ConnectionAction::Transmit(ClientMessage::Hello(hello)),
            ConnectionAction::StartHandshakeTimer(self.config.handshake_timeout),
        ]
    }

    pub fn on_server_hello(&mut self, hello: &ServerHello) -> Vec<ConnectionAction> {
        if !self.awaiting_hello {
            warn!(target = "undertow::connection", "unexpected server hello ignored");
            return Vec::new();
        }
        self.awaiting_hello = false;

        match hello.status {
            HandshakeStatus::Accepted => {
                self.attempt = 0;
                self.session_id = Some(hello.session_id.clone());
                self.transition(ConnectionState::Connected);
                info!(
                    target = "undertow::connection",
                    session = %hello.session_id,
                    next_seq = hello.next_seq,
                    resumed = hello.resumed(),
                    "handshake accepted"
                );
                let mut actions = vec![
                    ConnectionAction::CancelTimers,
                    ConnectionAction::StartHeartbeat(self.config.heartbeat_interval),
                    ConnectionAction::Accepted {
                        session_id: hello.session_id.clone(),
                        next_seq: hello.next_seq,
                        resumed: hello.resumed(),
                        full_state_follows: hello.full_state_follows(),
                    },
                ];
                actions.extend(self.queue.drain().map(ConnectionAction::Transmit));
                actions
            }
            HandshakeStatus::Rejected(reason) => {
                warn!(
                    target = "undertow::connection",
                    code = reason.code(),
                    reason = %reason,
                    "handshake rejected"
                );
                if reason == RejectReason::SessionExpired {
                    self.session_id = None;
                }
                self.transition(ConnectionState::Disconnected);
                vec![
                    ConnectionAction::CancelTimers,
                    ConnectionAction::Close,
                    ConnectionAction::Rejected(reason),
                ]
            }
        }
    }

    /// `clean` closes (Goodbye, local stop) end the connection; anything else reconnects.
    pub fn on_transport_closed(&mut self, clean: bool) -> Vec<ConnectionAction> {
        self.awaiting_hello = false;
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => Vec::new(),
            _ if clean => {
                self.transition(ConnectionState::Disconnected);
                vec![ConnectionAction::CancelTimers]
            }
            _ => self.schedule_retry(),
        }
    }

    /// The handshake timer fired before a ServerHello arrived.
    pub fn on_handshake_timeout(&mut self) -> Vec<ConnectionAction> {
        if !self.awaiting_hello {
            return Vec::new();
        }
        warn!(target = "undertow::connection", "handshake timed out");
        let mut actions = vec![ConnectionAction::Close];
        actions.extend(self.on_transport_closed(false));
        actions
    }

    pub fn on_retry_elapsed(&mut self) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Reconnecting {
            return Vec::new();
        }
        self.transition(ConnectionState::Connecting);
        vec![ConnectionAction::Open]
    }

    /// Transmits immediately when connected, otherwise queues for the next connection.
    pub fn send(&mut self, message: ClientMessage) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state == ConnectionState::Connected {
            return Ok(vec![ConnectionAction::Transmit(message)]);
        }
        if !self.queue.enqueue(message) {
            return Err(ConnectionError::QueueFull {
                limit: self.queue.limit(),
            });
        }
        debug!(
            target = "undertow::connection",
            queued = self.queue.len(),
            "message queued while offline"
        );
        Ok(Vec::new())
    }

    /// Session-scoped messages (acks, heartbeats, resync requests) are never queued.
    pub fn send_if_connected(&mut self, message: ClientMessage) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Connected {
            vec![ConnectionAction::Transmit(message)]
        } else {
            Vec::new()
        }
    }

    pub fn stop(&mut self) -> Vec<ConnectionAction> {
        self.awaiting_hello = false;
        self.transition(ConnectionState::Disconnected);
        vec![ConnectionAction::Close, ConnectionAction::CancelTimers]
    }

    fn schedule_retry(&mut self) -> Vec<ConnectionAction> {
        if self.config.backoff.exhausted(self.attempt) {
            warn!(
                target = "undertow::connection",
                attempts = self.attempt,
                "retry budget exhausted"
            );
            self.transition(ConnectionState::Disconnected);
            return vec![
                ConnectionAction::CancelTimers,
                ConnectionAction::GaveUp {
                    attempts: self.attempt,
                },
            ];
        }
        let delay = self.config.backoff.delay_for(self.attempt);
        self.attempt += 1;
        crate::metrics::RECONNECT_ATTEMPTS.inc();
        info!(
            target = "undertow::connection",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.transition(ConnectionState::Reconnecting);
        vec![
            ConnectionAction::CancelTimers,
            ConnectionAction::ScheduleRetry(delay),
        ]
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(
                target = "undertow::connection",
                from = self.state.as_str(),
                to = next.as_str(),
                "connection state changed"
            );
            self.state = next;
        }
    }
}
