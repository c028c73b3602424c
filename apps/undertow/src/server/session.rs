use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::view::View;
use crate::protocol::{
    Ack, ClientEvent, ClientMessage, Control, ErrorFrame, Patch, PatchBatch, ServerMessage,
};

/// Window assumed until the renderer's first Ack advertises its own.
pub const DEFAULT_SEND_WINDOW: u32 = 16;

/// Messages for the peer, plus whether the link should close after sending them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SessionOutput {
    pub messages: Vec<ServerMessage>,
    pub close: bool,
}

impl SessionOutput {
    fn send(message: ServerMessage) -> Self {
        Self {
            messages: vec![message],
            close: false,
        }
    }
}

/// Server-side state for one session. Survives its connection for the resume window.
pub struct SessionState {
    id: String,
    view: Box<dyn View>,
    last_sent: u64,
    last_acked: u64,
    window: u32,
    /// Composed batches waiting for window space.
    queued: VecDeque<PatchBatch>,
    next_composed: u64,
    last_event_seq: u64,
    attached: bool,
    detached_at: Option<Instant>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("last_sent", &self.last_sent)
            .field("last_acked", &self.last_acked)
            .field("window", &self.window)
            .field("queued", &self.queued.len())
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl SessionState {
    pub fn new(id: String, view: Box<dyn View>) -> Self {
        Self {
            id,
            view,
            last_sent: 0,
            last_acked: 0,
            window: DEFAULT_SEND_WINDOW,
            queued: VecDeque::new(),
            next_composed: 1,
            last_event_seq: 0,
            attached: false,
            detached_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Newest sequence number handed to the transport.
    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn attach(&mut self) {
        self.attached = true;
        self.detached_at = None;
    }

    pub fn detach(&mut self, now: Instant) {
        self.attached = false;
        self.detached_at = Some(now);
    }

    pub fn detached_at(&self) -> Option<Instant> {
        self.detached_at
    }

    /// Serialises the whole view and restarts sequencing at zero.
    pub fn full_state(&mut self) -> Result<ServerMessage, serde_json::Error> {
        let tree = self.view.render().to_json()?;
        self.last_sent = 0;
        self.last_acked = 0;
        self.next_composed = 1;
        self.queued.clear();
        Ok(ServerMessage::Control(Control::FullResync { tree }))
    }

    /// Wraps `patches` in the next batch and returns whatever fits in the window.
    pub fn push_patches(&mut self, patches: Vec<Patch>) -> Vec<ServerMessage> {
        if !patches.is_empty() {
            let batch = PatchBatch::new(self.next_composed, patches);
            self.next_composed += 1;
            self.queued.push_back(batch);
        }
        self.flush()
    }

    fn flush(&mut self) -> Vec<ServerMessage> {
        let limit = self.last_acked.saturating_add(u64::from(self.window));
        let mut out = Vec::new();
        while self.queued.front().is_some_and(|batch| batch.seq <= limit) {
            let Some(batch) = self.queued.pop_front() else {
                break;
            };
            self.last_sent = batch.seq;
            out.push(ServerMessage::Patches(batch));
        }
        if !self.queued.is_empty() {
            trace!(target = "undertow::server", session = %self.id, waiting = self.queued.len(), limit, "send window full");
        }
        out
    }

    pub fn on_message(&mut self, message: ClientMessage) -> SessionOutput {
        match message {
            ClientMessage::Event(event) => self.on_event(event),
            ClientMessage::Ack(ack) => self.on_ack(ack),
            ClientMessage::Control(Control::Ping { timestamp_ms }) => {
                SessionOutput::send(ServerMessage::Control(Control::Pong { timestamp_ms }))
            }
            ClientMessage::Control(Control::ResyncRequest { last_seq }) => {
                self.on_resync_request(last_seq)
            }
            ClientMessage::Control(Control::Goodbye { reason }) => {
                debug!(target = "undertow::server", session = %self.id, %reason, "client said goodbye");
                SessionOutput {
                    messages: Vec::new(),
                    close: true,
                }
            }
            ClientMessage::Hello(_) => {
                warn!(target = "undertow::server", session = %self.id, "hello after handshake ignored");
                SessionOutput::default()
            }
            other => {
                trace!(target = "undertow::server", session = %self.id, message = other.label(), "ignoring message");
                SessionOutput::default()
            }
        }
    }

    fn on_event(&mut self, event: ClientEvent) -> SessionOutput {
        if event.seq <= self.last_event_seq {
            debug!(target = "undertow::server", session = %self.id, seq = event.seq, "duplicate event dropped");
            return SessionOutput::default();
        }
        self.last_event_seq = event.seq;
        match self.view.handle_event(&event) {
            Ok(patches) => SessionOutput {
                messages: self.push_patches(patches),
                close: false,
            },
            Err(err) => {
                debug!(target = "undertow::server", session = %self.id, error = %err, "view rejected event");
                SessionOutput {
                    messages: vec![ServerMessage::Error(ErrorFrame {
                        code: err.code,
                        message: err.message,
                        fatal: err.fatal,
                    })],
                    close: err.fatal,
                }
            }
        }
    }

    fn on_ack(&mut self, ack: Ack) -> SessionOutput {
        self.last_acked = self.last_acked.max(ack.last_seq.min(self.last_sent));
        self.window = ack.window.max(1);
        SessionOutput {
            messages: self.flush(),
            close: false,
        }
    }

    /// Always answered with full state. A request at the newest sequence still means the
    /// renderer could not apply all of it.
    fn on_resync_request(&mut self, last_seq: u64) -> SessionOutput {
        debug!(target = "undertow::server", session = %self.id, last_seq, last_sent = self.last_sent, "resync requested");
        match self.full_state() {
            Ok(message) => SessionOutput::send(message),
            Err(err) => {
                warn!(target = "undertow::server", session = %self.id, error = %err, "failed to serialise view");
                SessionOutput {
                    messages: vec![ServerMessage::Error(ErrorFrame {
                        code: 500,
                        message: "failed to serialise state".into(),
                        fatal: true,
                    })],
                    close: true,
                }
            }
        }
    }
}
