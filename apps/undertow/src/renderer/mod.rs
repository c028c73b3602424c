//! Renderer session: owns the local tree and drives the connection, sequencer,
//! reconciliation, event pipeline and optimistic tracker from one task.
//!
//! Everything that happens to a session (user interactions, inbound frames, timer
//! expiries, transport closure) is posted to a single queue and handled in order, so
//! none of the components needs its own synchronisation.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod runtime;
pub mod timers;

use crate::config::Config;
use crate::connection::{ConnectionConfig, ConnectionState};
use crate::effect::Effect;
use crate::events::DomEvent;
use crate::protocol::{DEFAULT_MAX_MESSAGE_BYTES, Subtree};
use crate::sync::SequencerConfig;
use crate::transport::Connector;

use runtime::{Input, Runtime};

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub connection: ConnectionConfig,
    pub sync: SequencerConfig,
    pub max_message_bytes: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            sync: SequencerConfig::default(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl RendererConfig {
    pub fn from_config(config: &Config, anti_forgery_token: impl Into<String>) -> Self {
        let mut connection = config.connection.clone();
        connection.anti_forgery_token = anti_forgery_token.into();
        Self {
            connection,
            sync: config.sync,
            max_message_bytes: config.limits.max_message_bytes,
        }
    }
}

#[derive(Debug)]
pub enum Command {
    Interaction(DomEvent),
    /// The user moved through browser history to `url`.
    HistoryPopped(String),
    Snapshot(oneshot::Sender<Snapshot>),
    /// Says goodbye to the server and ends the session.
    Stop,
}

/// Point-in-time view of a renderer session.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub tree: Subtree,
    pub last_applied: u64,
    pub expected: u64,
    pub resync_pending: bool,
    pub queued: usize,
    pub pending_optimistic: usize,
    pub pending_navigation: Option<String>,
    pub last_event_seq: u64,
}

/// Owning handle to a running renderer session. Dropping it ends the session.
pub struct RendererHandle {
    inputs: mpsc::UnboundedSender<Input>,
    effects: mpsc::UnboundedReceiver<Effect>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Starts a renderer session that connects through `connector`.
pub fn spawn(config: RendererConfig, connector: Arc<dyn Connector>) -> RendererHandle {
    let (inputs, queue) = mpsc::unbounded_channel();
    let (effects_tx, effects) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
    let shutdown = CancellationToken::new();
    let runtime = Runtime::new(
        config,
        connector,
        inputs.clone(),
        effects_tx,
        state_tx,
        shutdown.clone(),
    );
    let task = tokio::spawn(runtime.run(queue));
    RendererHandle {
        inputs,
        effects,
        state,
        shutdown,
        task: Some(task),
    }
}

impl RendererHandle {
    /// Returns `false` once the session has ended.
    pub fn command(&self, command: Command) -> bool {
        self.inputs.send(Input::Command(command)).is_ok()
    }

    pub fn interact(&self, event: DomEvent) -> bool {
        self.command(Command::Interaction(event))
    }

    pub fn history_popped(&self, url: impl Into<String>) -> bool {
        self.command(Command::HistoryPopped(url.into()))
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.command(Command::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    pub async fn next_effect(&mut self) -> Option<Effect> {
        self.effects.recv().await
    }

    pub fn try_next_effect(&mut self) -> Option<Effect> {
        self.effects.try_recv().ok()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the session reaches `target`; `false` if it ended first.
    pub async fn wait_for(&self, target: ConnectionState) -> bool {
        let mut watch = self.state.clone();
        watch.wait_for(|state| *state == target).await.is_ok()
    }

    /// Waits for the session task to finish.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RendererHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{
        ClientMessage, Control, HELLO_FLAG_FULL_STATE_FOLLOWS, HandshakeStatus, NodeRef, Patch,
        PatchBatch, ServerHello, ServerMessage, decode_client_bytes, encode_server_message,
    };
    use crate::transport::{Link, memory_endpoint};

    async fn expect_client(link: &mut Link) -> ClientMessage {
        let bytes = link.recv().await.expect("client message");
        decode_client_bytes(&bytes).expect("decode")
    }

    fn send(link: &Link, message: ServerMessage) {
        link.send(encode_server_message(&message)).expect("send");
    }

    fn accept(link: &Link, next_seq: u32) {
        send(
            link,
            ServerMessage::ServerHello(ServerHello {
                status: HandshakeStatus::Accepted,
                session_id: "s-1".into(),
                next_seq,
                server_time_ms: 0,
                flags: HELLO_FLAG_FULL_STATE_FOLLOWS,
            }),
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn handshake_then_patches_are_applied_and_acked() {
        let (connector, mut acceptor) = memory_endpoint();
        let mut handle = spawn(RendererConfig::default(), Arc::new(connector));
        let mut server = acceptor.accept().await.expect("link");

        let ClientMessage::Hello(hello) = expect_client(&mut server).await else {
            panic!("expected hello");
        };
        assert_eq!(hello.last_seq, 0);
        assert_eq!(hello.resume_session_id, None);
        accept(&server, 1);
        assert!(handle.wait_for(ConnectionState::Connected).await);

        let tree = Subtree::element("main").with_id("app").to_json().expect("json");
        send(
            &server,
            ServerMessage::Control(Control::FullResync { tree }),
        );
        send(
            &server,
            ServerMessage::Patches(PatchBatch::new(
                1,
                vec![Patch::SetTitle {
                    title: "Hello".into(),
                }],
            )),
        );
        assert_eq!(
            handle.next_effect().await,
            Some(Effect::SetTitle("Hello".into()))
        );
        let ClientMessage::Ack(ack) = expect_client(&mut server).await else {
            panic!("expected ack");
        };
        assert_eq!(ack.last_seq, 1);

        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.session_id.as_deref(), Some("s-1"));
        assert_eq!(snapshot.last_applied, 1);
        let Subtree::Fragment { children } = snapshot.tree else {
            panic!("expected root fragment");
        };
        assert!(matches!(
            children.as_slice(),
            [Subtree::Element { id: Some(id), .. }] if *id == NodeRef::from("app")
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stop_says_goodbye() {
        let (connector, mut acceptor) = memory_endpoint();
        let handle = spawn(RendererConfig::default(), Arc::new(connector));
        let mut server = acceptor.accept().await.expect("link");
        expect_client(&mut server).await;
        accept(&server, 1);
        assert!(handle.wait_for(ConnectionState::Connected).await);

        handle.stop();
        assert!(matches!(
            expect_client(&mut server).await,
            ClientMessage::Control(Control::Goodbye { .. })
        ));
        assert_eq!(server.recv().await, None);
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.join().await;
    }
}
