use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::timers::{TimerKind, Timers};
use super::{Command, RendererConfig, Snapshot};
use crate::connection::{ConnectionAction, ConnectionManager, ConnectionState};
use crate::dom::ReconcileEngine;
use crate::effect::Effect;
use crate::events::{DomEvent, EventPipeline};
use crate::metrics;
use crate::optimistic::OptimisticTracker;
use crate::protocol::{
    self, Ack, ClientEvent, ClientMessage, Control, ErrorFrame, FrameReader, PatchBatch,
    ServerMessage, decode_server_message, encode_client_message,
};
use crate::sync::Sequencer;
use crate::transport::{Connector, Link, LinkSender, TransportError};

/// Everything the session loop reacts to, in arrival order.
pub(super) enum Input {
    Command(Command),
    Opened { epoch: u64, link: Link },
    ConnectFailed { epoch: u64, error: TransportError },
    Inbound { epoch: u64, bytes: Vec<u8> },
    Closed { epoch: u64 },
    Timer { kind: TimerKind, generation: u64 },
}

/// Single-owner state of one renderer session. Only the loop touches it.
pub(super) struct Runtime {
    connector: Arc<dyn Connector>,
    manager: ConnectionManager,
    sequencer: Sequencer,
    engine: ReconcileEngine,
    pipeline: EventPipeline,
    tracker: OptimisticTracker,
    reader: FrameReader,
    max_message_bytes: usize,
    link: Option<LinkSender>,
    /// Bumped whenever a link is opened or abandoned; stale link traffic is ignored.
    epoch: u64,
    timers: Timers,
    queue: mpsc::UnboundedSender<Input>,
    effects: mpsc::UnboundedSender<Effect>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Runtime {
    pub(super) fn new(
        config: RendererConfig,
        connector: Arc<dyn Connector>,
        queue: mpsc::UnboundedSender<Input>,
        effects: mpsc::UnboundedSender<Effect>,
        state: watch::Sender<ConnectionState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            manager: ConnectionManager::new(config.connection),
            sequencer: Sequencer::new(config.sync),
            engine: ReconcileEngine::new(),
            pipeline: EventPipeline::new(),
            tracker: OptimisticTracker::new(),
            reader: FrameReader::new(config.max_message_bytes),
            max_message_bytes: config.max_message_bytes,
            link: None,
            epoch: 0,
            timers: Timers::new(shutdown.clone()),
            queue,
            effects,
            state,
            shutdown,
        }
    }

    pub(super) async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        info!(target = "undertow::renderer", connector = %self.connector.describe(), "renderer session starting");
        let actions = self.manager.start();
        self.execute(actions);
        self.publish_state();

        loop {
            let input = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            let stop = self.handle(input);
            self.sweep_retired();
            self.publish_state();
            if stop {
                break;
            }
        }

        if let Some(link) = self.link.take() {
            link.close();
        }
        self.shutdown.cancel();
        debug!(target = "undertow::renderer", "renderer session stopped");
    }

    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(command) => return self.on_command(command),
            Input::Opened { epoch, link } => self.on_opened(epoch, link),
            Input::ConnectFailed { epoch, error } => {
                if epoch == self.epoch {
                    warn!(target = "undertow::renderer", error = %error, "connect failed");
                    let actions = self.manager.on_transport_closed(false);
                    self.execute(actions);
                }
            }
            Input::Inbound { epoch, bytes } => {
                if epoch != self.epoch {
                    trace!(target = "undertow::renderer", epoch, current = self.epoch, "frame from superseded link ignored");
                    return false;
                }
                self.on_bytes(&bytes);
            }
            Input::Closed { epoch } => {
                if epoch == self.epoch && self.link.is_some() {
                    self.on_link_lost();
                }
            }
            Input::Timer { kind, generation } => {
                if self.timers.fire(kind, generation) {
                    self.on_timer(kind);
                }
            }
        }
        false
    }

    /// Nodes removed while handling the last input take their event state with them.
    fn sweep_retired(&mut self) {
        let retired = self.engine.take_retired();
        if !retired.is_empty() {
            trace!(target = "undertow::renderer", nodes = retired.len(), "forgetting event state");
            self.pipeline.forget(&retired);
        }
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Interaction(event) => self.on_interaction(event),
            Command::HistoryPopped(url) => {
                let event = self.pipeline.history_popped(url.clone());
                self.engine.set_pending_navigation(url);
                self.send_event(event);
            }
            Command::Snapshot(reply) => self.reply_snapshot(reply),
            Command::Stop => {
                if self.manager.state() == ConnectionState::Connected {
                    self.transmit(&ClientMessage::Control(Control::Goodbye {
                        reason: "renderer stopped".into(),
                    }));
                }
                let actions = self.manager.stop();
                self.execute(actions);
                return true;
            }
        }
        false
    }

    fn on_interaction(&mut self, event: DomEvent) {
        let now = Instant::now();
        let outcome = self.pipeline.dispatch(&self.engine, event, now);
        if let Some(url) = outcome.navigation {
            self.engine.set_pending_navigation(url);
        }
        for (node, action) in &outcome.optimistic {
            match self.tracker.apply(&mut self.engine, node, action) {
                Ok(effects) => self.emit_all(effects),
                Err(err) => {
                    warn!(target = "undertow::renderer", node = %node, error = %err, "optimistic update refused")
                }
            }
        }
        for event in outcome.emitted {
            self.send_event(event);
        }
        self.arm_debounce(now);
    }

    fn arm_debounce(&mut self, now: Instant) {
        match self.pipeline.next_deadline() {
            Some(deadline) => {
                let delay = deadline.saturating_duration_since(now);
                self.timers
                    .arm(TimerKind::Debounce, delay, &self.queue, |kind, generation| {
                        Input::Timer { kind, generation }
                    });
            }
            None => self.timers.cancel(TimerKind::Debounce),
        }
    }

    fn send_event(&mut self, event: ClientEvent) {
        match self.manager.send(ClientMessage::Event(event)) {
            Ok(actions) => self.execute(actions),
            Err(err) => warn!(target = "undertow::renderer", error = %err, "event dropped"),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        trace!(target = "undertow::renderer", timer = kind.as_str(), "timer fired");
        let actions = match kind {
            TimerKind::Handshake => self.manager.on_handshake_timeout(),
            TimerKind::Retry => self.manager.on_retry_elapsed(),
            TimerKind::Heartbeat => {
                if self.manager.state() != ConnectionState::Connected {
                    return;
                }
                let interval = self.manager.heartbeat_interval();
                self.timers
                    .arm(TimerKind::Heartbeat, interval, &self.queue, |kind, generation| {
                        Input::Timer { kind, generation }
                    });
                let ping = Control::Ping {
                    timestamp_ms: protocol::unix_time_ms(),
                };
                self.manager.send_if_connected(ClientMessage::Control(ping))
            }
            TimerKind::Debounce => {
                let now = Instant::now();
                for event in self.pipeline.poll_due(&self.engine, now) {
                    self.send_event(event);
                }
                self.arm_debounce(now);
                return;
            }
        };
        self.execute(actions);
    }

    fn on_opened(&mut self, epoch: u64, link: Link) {
        if epoch != self.epoch || self.manager.state() != ConnectionState::Connecting {
            debug!(target = "undertow::renderer", link = %link.id(), "discarding superseded link");
            link.close();
            return;
        }
        let (sender, mut receiver) = link.split();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                if queue.send(Input::Inbound { epoch, bytes }).is_err() {
                    return;
                }
            }
            let _ = queue.send(Input::Closed { epoch });
        });
        debug!(target = "undertow::renderer", link = %sender.id(), kind = sender.kind().as_str(), "link open");
        self.link = Some(sender);
        self.reader = FrameReader::new(self.max_message_bytes);
        let last_seq = u32::try_from(self.sequencer.last_applied()).unwrap_or(u32::MAX);
        let actions = self.manager.on_transport_open(last_seq);
        self.execute(actions);
    }

    fn on_link_lost(&mut self) {
        info!(target = "undertow::renderer", state = self.manager.state().as_str(), "transport lost");
        self.drop_link();
        if let Some(url) = self.engine.take_pending_navigation() {
            self.emit(Effect::AssignLocation(url));
        }
        let actions = self.manager.on_transport_closed(false);
        self.execute(actions);
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        for frame in self.reader.feed(bytes) {
            let decoded = frame.and_then(|frame| decode_server_message(&frame));
            match decoded {
                Ok(message) => {
                    metrics::FRAMES_IN.with_label_values(&[message.label()]).inc();
                    self.on_message(message);
                }
                Err(err) => {
                    metrics::DECODE_FAILURES.inc();
                    warn!(target = "undertow::renderer", error = %err, "dropping malformed frame");
                }
            }
        }
    }

    fn on_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ServerHello(hello) => {
                let actions = self.manager.on_server_hello(&hello);
                self.execute(actions);
            }
            ServerMessage::Patches(batch) => self.on_patches(batch),
            ServerMessage::Control(Control::FullResync { tree }) => self.on_full_resync(&tree),
            ServerMessage::Control(Control::Ping { timestamp_ms }) => {
                let actions = self
                    .manager
                    .send_if_connected(ClientMessage::Control(Control::Pong { timestamp_ms }));
                self.execute(actions);
            }
            ServerMessage::Control(Control::Pong { timestamp_ms }) => {
                let now = protocol::unix_time_ms();
                trace!(target = "undertow::renderer", rtt_ms = now.saturating_sub(timestamp_ms), "pong");
            }
            ServerMessage::Control(Control::Goodbye { reason }) => {
                info!(target = "undertow::renderer", %reason, "server closed the session");
                self.drop_link();
                let actions = self.manager.on_transport_closed(true);
                self.execute(actions);
            }
            ServerMessage::Control(other) => {
                trace!(target = "undertow::renderer", control = ?other, "ignoring control message");
            }
            ServerMessage::Error(error) => self.on_server_error(error),
            ServerMessage::Unknown { frame_type } => {
                trace!(target = "undertow::renderer", frame_type, "ignoring unknown frame type");
            }
        }
    }

    fn on_patches(&mut self, batch: PatchBatch) {
        if self.manager.state() != ConnectionState::Connected {
            debug!(target = "undertow::renderer", seq = batch.seq, "patches before handshake ignored");
            return;
        }
        let delivery = self.sequencer.receive(batch);
        for ready in &delivery.ready {
            let outcome = self.engine.apply_batch(ready);
            self.tracker.clear();
            debug!(
                target = "undertow::renderer",
                seq = ready.seq,
                applied = outcome.applied,
                healed = outcome.healed,
                truncated = outcome.truncated,
                "batch applied"
            );
            self.emit_all(outcome.effects);
            if outcome.truncated {
                if let Some(last_seq) = self.sequencer.request_resync() {
                    self.request_resync(last_seq);
                }
            }
        }
        if let Some(ack) = delivery.ack {
            self.send_ack(ack);
        }
        if let Some(last_seq) = delivery.resync_from {
            self.request_resync(last_seq);
        }
    }

    fn send_ack(&mut self, ack: Ack) {
        let actions = self.manager.send_if_connected(ClientMessage::Ack(ack));
        self.execute(actions);
    }

    fn request_resync(&mut self, last_seq: u64) {
        info!(target = "undertow::renderer", last_seq, "requesting resync");
        let actions = self
            .manager
            .send_if_connected(ClientMessage::Control(Control::ResyncRequest { last_seq }));
        self.execute(actions);
    }

    fn on_full_resync(&mut self, tree: &str) {
        self.tracker.clear();
        match self.engine.replace_root_json(tree) {
            Ok(effects) => {
                self.sequencer.full_reset();
                self.pipeline.reset_bindings();
                self.arm_debounce(Instant::now());
                info!(
                    target = "undertow::renderer",
                    nodes = self.engine.registered(),
                    "full state applied"
                );
                self.emit_all(effects);
            }
            Err(err) => {
                warn!(target = "undertow::renderer", error = %err, "full state unusable; self-healing");
                let effect = self.engine.self_heal();
                self.emit(effect);
            }
        }
    }

    fn on_server_error(&mut self, error: ErrorFrame) {
        warn!(
            target = "undertow::renderer",
            code = error.code,
            message = %error.message,
            fatal = error.fatal,
            "server reported an error"
        );
        let effects = self.tracker.rollback(&mut self.engine);
        self.emit_all(effects);
        self.emit(Effect::ServerError {
            code: error.code,
            message: error.message,
            fatal: error.fatal,
        });
        if error.fatal && self.link.is_some() {
            self.on_link_lost();
        }
    }

    fn reply_snapshot(&self, reply: oneshot::Sender<Snapshot>) {
        let snapshot = Snapshot {
            state: self.manager.state(),
            session_id: self.manager.session_id().map(str::to_string),
            tree: self.engine.materialize(),
            last_applied: self.sequencer.last_applied(),
            expected: self.sequencer.expected(),
            resync_pending: self.sequencer.resync_pending(),
            queued: self.manager.queued(),
            pending_optimistic: self.tracker.pending().len(),
            pending_navigation: self.engine.pending_navigation().map(str::to_string),
            last_event_seq: self.pipeline.last_seq(),
        };
        let _ = reply.send(snapshot);
    }

    fn execute(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::Open => self.open(),
                ConnectionAction::Transmit(message) => self.transmit(&message),
                ConnectionAction::StartHandshakeTimer(delay) => self.arm(TimerKind::Handshake, delay),
                ConnectionAction::StartHeartbeat(delay) => self.arm(TimerKind::Heartbeat, delay),
                ConnectionAction::ScheduleRetry(delay) => self.arm(TimerKind::Retry, delay),
                ConnectionAction::Accepted {
                    session_id,
                    next_seq,
                    resumed,
                    full_state_follows,
                } => {
                    debug!(
                        target = "undertow::renderer",
                        session = %session_id,
                        next_seq,
                        resumed,
                        full_state_follows,
                        "session established"
                    );
                    self.sequencer.reset_expected(u64::from(next_seq));
                }
                ConnectionAction::Rejected(reason) => self.emit(Effect::HandshakeRejected(reason)),
                ConnectionAction::GaveUp { attempts } => self.emit(Effect::GaveUp { attempts }),
                ConnectionAction::Close => self.drop_link(),
                ConnectionAction::CancelTimers => self.timers.cancel_connection(),
            }
        }
    }

    fn open(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let connector = self.connector.clone();
        let queue = self.queue.clone();
        let cancelled = self.shutdown.child_token();
        tokio::spawn(async move {
            let input = tokio::select! {
                _ = cancelled.cancelled() => return,
                result = connector.connect() => match result {
                    Ok(link) => Input::Opened { epoch, link },
                    Err(error) => Input::ConnectFailed { epoch, error },
                },
            };
            let _ = queue.send(input);
        });
    }

    fn transmit(&mut self, message: &ClientMessage) {
        let Some(link) = &self.link else {
            debug!(target = "undertow::renderer", message = message.label(), "no link; message dropped");
            return;
        };
        metrics::FRAMES_OUT.with_label_values(&[message.label()]).inc();
        if let Err(err) = link.send(encode_client_message(message)) {
            debug!(target = "undertow::renderer", error = %err, "transmit failed");
            // The reader task reports the closure; nothing else to do here.
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: std::time::Duration) {
        self.timers
            .arm(kind, delay, &self.queue, |kind, generation| Input::Timer {
                kind,
                generation,
            });
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
            self.epoch += 1;
        }
    }

    fn emit(&self, effect: Effect) {
        debug!(target = "undertow::renderer", effect = effect.label(), "effect");
        let _ = self.effects.send(effect);
    }

    fn emit_all(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.emit(effect);
        }
    }

    fn publish_state(&self) {
        let state = self.manager.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
