use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::ServerConfig;
use super::session::SessionState;
use super::token::TokenIssuer;
use super::view::ViewFactory;
use crate::protocol::{
    HELLO_FLAG_FULL_STATE_FOLLOWS, HELLO_FLAG_RESUMED, HandshakeStatus, Hello, PROTOCOL_MAJOR,
    RejectReason, ServerHello, ServerMessage, unix_time_ms,
};

pub type SharedSession = Arc<Mutex<SessionState>>;

/// Result of an accepted handshake: the attached session and what to send first.
pub struct Accepted {
    pub session: SharedSession,
    pub hello: ServerHello,
    pub initial: Vec<ServerMessage>,
}

/// All live sessions of one server. Each session's state sits behind its own lock.
pub struct SessionRegistry {
    sessions: DashMap<String, SharedSession>,
    config: ServerConfig,
    tokens: TokenIssuer,
    factory: ViewFactory,
}

impl SessionRegistry {
    pub fn new(config: ServerConfig, factory: ViewFactory) -> Self {
        let tokens = TokenIssuer::new(&config.secret);
        Self {
            sessions: DashMap::new(),
            config,
            tokens,
            factory,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn handshake(&self, hello: &Hello, now: Instant) -> Result<Accepted, RejectReason> {
        self.expire(now);

        if hello.protocol_major != PROTOCOL_MAJOR {
            return Err(RejectReason::VersionMismatch);
        }
        if hello.protocol_minor < self.config.min_protocol_minor {
            return Err(RejectReason::UpgradeRequired);
        }
        if let Err(err) = self.tokens.verify(&hello.anti_forgery_token) {
            debug!(target = "undertow::server", error = %err, "anti-forgery check failed");
            return Err(RejectReason::BadAntiForgeryToken);
        }

        let resume = hello
            .resume_session_id
            .as_deref()
            .filter(|id| !id.is_empty());
        let existing = resume.and_then(|id| self.get(id));
        if existing.is_none() && self.sessions.len() >= self.config.max_sessions {
            return Err(RejectReason::ServerBusy);
        }

        match (resume, existing) {
            (Some(id), None) => {
                debug!(target = "undertow::server", session = id, "resume id unknown or expired");
                Err(RejectReason::SessionExpired)
            }
            (_, Some(session)) => self.resume(session, hello),
            (None, None) => self.open(),
        }
    }

    fn resume(&self, session: SharedSession, hello: &Hello) -> Result<Accepted, RejectReason> {
        let mut state = session.lock();
        if state.is_attached() {
            return Err(RejectReason::Unauthorized);
        }
        let (next_seq, flags, initial) = if u64::from(hello.last_seq) == state.last_sent() {
            let next = state.last_sent().saturating_add(1);
            (next, HELLO_FLAG_RESUMED, Vec::new())
        } else {
            let full = state
                .full_state()
                .map_err(|_| RejectReason::InternalError)?;
            (1, HELLO_FLAG_RESUMED | HELLO_FLAG_FULL_STATE_FOLLOWS, vec![full])
        };
        state.attach();
        info!(
            target = "undertow::server",
            session = state.id(),
            client_last_seq = hello.last_seq,
            next_seq,
            full_state = initial.len(),
            "session resumed"
        );
        let hello = ServerHello {
            status: HandshakeStatus::Accepted,
            session_id: state.id().to_string(),
            next_seq: u32::try_from(next_seq).unwrap_or(u32::MAX),
            server_time_ms: unix_time_ms(),
            flags,
        };
        drop(state);
        Ok(Accepted {
            session,
            hello,
            initial,
        })
    }

    fn open(&self) -> Result<Accepted, RejectReason> {
        let id = Uuid::new_v4().to_string();
        let mut state = SessionState::new(id.clone(), (self.factory)());
        let full = state
            .full_state()
            .map_err(|_| RejectReason::InternalError)?;
        state.attach();
        let session = Arc::new(Mutex::new(state));
        self.sessions.insert(id.clone(), session.clone());
        crate::metrics::ACTIVE_SESSIONS.set(self.sessions.len() as i64);
        info!(target = "undertow::server", session = %id, sessions = self.sessions.len(), "session opened");
        Ok(Accepted {
            session,
            hello: ServerHello {
                status: HandshakeStatus::Accepted,
                session_id: id,
                next_seq: 1,
                server_time_ms: unix_time_ms(),
                flags: HELLO_FLAG_FULL_STATE_FOLLOWS,
            },
            initial: vec![full],
        })
    }

    /// The session's connection went away; keep it for the resume window.
    pub fn detach(&self, session_id: &str, now: Instant) {
        if let Some(session) = self.get(session_id) {
            session.lock().detach(now);
        }
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        crate::metrics::ACTIVE_SESSIONS.set(self.sessions.len() as i64);
        removed
    }

    /// Drops detached sessions older than the resume window.
    pub fn expire(&self, now: Instant) -> usize {
        let window = self.config.resume_window;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .lock()
                    .detached_at()
                    .is_some_and(|since| now.saturating_duration_since(since) >= window)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            debug!(target = "undertow::server", session = %id, "session expired");
            self.remove(id);
        }
        expired.len()
    }
}
