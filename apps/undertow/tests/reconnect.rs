use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use undertow::connection::{BackoffPolicy, ConnectionState};
use undertow::effect::Effect;
use undertow::events::DomEvent;
use undertow::protocol::{
    ClientMessage, Control, ErrorFrame, EventKind, HELLO_FLAG_FULL_STATE_FOLLOWS,
    HandshakeStatus, NavigationTrigger, RejectReason, ServerHello, ServerMessage, Subtree,
    decode_client_bytes, encode_server_message,
};
use undertow::renderer::{self, RendererConfig};
use undertow::transport::{
    Connector, Link, MemoryConnector, TransportError, memory_endpoint,
};

/// Fails the first `failures` attempts, then delegates; records when each attempt began.
struct FlakyConnector {
    failures: AtomicU32,
    inner: Option<MemoryConnector>,
    attempts: Mutex<Vec<Instant>>,
}

impl FlakyConnector {
    fn new(failures: u32, inner: Option<MemoryConnector>) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            inner,
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn gaps(&self) -> Vec<Duration> {
        self.attempts
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        self.attempts.lock().push(Instant::now());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        match (&self.inner, failing) {
            (Some(inner), false) => inner.connect().await,
            _ => Err(TransportError::Unreachable("scripted failure".into())),
        }
    }

    fn describe(&self) -> String {
        "flaky".into()
    }
}

fn config(base_ms: u64, cap_ms: u64, max_attempts: u32) -> RendererConfig {
    let mut config = RendererConfig::default();
    config.connection.backoff = BackoffPolicy {
        base: Duration::from_millis(base_ms),
        cap: Duration::from_millis(cap_ms),
        max_attempts,
    };
    config.connection.handshake_timeout = Duration::from_secs(1);
    config
}

async fn next_client(link: &mut Link) -> ClientMessage {
    let bytes = link.recv().await.expect("client frame");
    decode_client_bytes(&bytes).expect("decode")
}

fn send(link: &Link, message: ServerMessage) {
    link.send(encode_server_message(&message)).expect("send");
}

fn accept(link: &Link) {
    send(
        link,
        ServerMessage::ServerHello(ServerHello {
            status: HandshakeStatus::Accepted,
            session_id: "sess-reconnect".into(),
            next_seq: 1,
            server_time_ms: 0,
            flags: HELLO_FLAG_FULL_STATE_FOLLOWS,
        }),
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn backoff_doubles_to_the_cap_then_gives_up() {
    let connector = FlakyConnector::new(u32::MAX, None);
    let mut handle = renderer::spawn(config(100, 250, 3), connector.clone());

    assert_eq!(
        handle.next_effect().await,
        Some(Effect::GaveUp { attempts: 3 })
    );
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(
        connector.gaps(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(250),
        ]
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn successful_handshake_resets_the_attempt_counter() {
    let (memory, mut acceptor) = memory_endpoint();
    let connector = FlakyConnector::new(2, Some(memory));
    let handle = renderer::spawn(config(100, 10_000, 10), connector.clone());

    let mut first = acceptor.accept().await.expect("link after two failures");
    assert!(matches!(next_client(&mut first).await, ClientMessage::Hello(_)));
    accept(&first);
    assert!(handle.wait_for(ConnectionState::Connected).await);
    assert_eq!(
        connector.gaps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );

    let dropped_at = Instant::now();
    first.close();
    let mut second = acceptor.accept().await.expect("reconnected link");
    assert_eq!(Instant::now() - dropped_at, Duration::from_millis(100));
    let ClientMessage::Hello(hello) = next_client(&mut second).await else {
        panic!("expected hello");
    };
    assert_eq!(hello.resume_session_id.as_deref(), Some("sess-reconnect"));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn silent_server_trips_the_handshake_timer() {
    let (memory, mut acceptor) = memory_endpoint();
    let handle = renderer::spawn(config(100, 1_000, 5), Arc::new(memory));

    let mut first = acceptor.accept().await.expect("link");
    let opened = Instant::now();
    assert!(matches!(next_client(&mut first).await, ClientMessage::Hello(_)));
    assert_eq!(first.recv().await, None);
    assert_eq!(Instant::now() - opened, Duration::from_secs(1));

    let mut second = acceptor.accept().await.expect("retry link");
    assert!(matches!(next_client(&mut second).await, ClientMessage::Hello(_)));
    assert_eq!(handle.state(), ConnectionState::Connecting);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn rejection_is_surfaced_and_not_retried() {
    let (memory, mut acceptor) = memory_endpoint();
    let mut handle = renderer::spawn(config(100, 1_000, 5), Arc::new(memory));

    let mut link = acceptor.accept().await.expect("link");
    next_client(&mut link).await;
    send(
        &link,
        ServerMessage::ServerHello(ServerHello::rejected(RejectReason::BadAntiForgeryToken, 0)),
    );
    assert_eq!(
        handle.next_effect().await,
        Some(Effect::HandshakeRejected(RejectReason::BadAntiForgeryToken))
    );
    assert_eq!(link.recv().await, None);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn transport_loss_completes_a_pending_navigation() {
    let (memory, mut acceptor) = memory_endpoint();
    let mut handle = renderer::spawn(config(100, 1_000, 5), Arc::new(memory));
    let mut link = acceptor.accept().await.expect("link");
    next_client(&mut link).await;
    accept(&link);
    let tree = Subtree::element("a")
        .with_id("docs")
        .with_attr("ut-link", "/docs")
        .to_json()
        .expect("json");
    send(&link, ServerMessage::Control(Control::FullResync { tree }));

    // Round-trip a snapshot so the full state is in place before clicking.
    handle.snapshot().await.expect("snapshot");
    assert!(handle.interact(DomEvent::new("docs", EventKind::Click { x: 1, y: 1 })));
    let ClientMessage::Event(event) = next_client(&mut link).await else {
        panic!("expected navigation event");
    };
    assert_eq!(
        event.kind,
        EventKind::Navigate {
            url: "/docs".into(),
            trigger: NavigationTrigger::Link,
        }
    );

    link.close();
    assert_eq!(
        handle.next_effect().await,
        Some(Effect::AssignLocation("/docs".into()))
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn fatal_error_rolls_back_and_reconnects() {
    let (memory, mut acceptor) = memory_endpoint();
    let mut handle = renderer::spawn(config(100, 1_000, 5), Arc::new(memory));
    let mut link = acceptor.accept().await.expect("link");
    next_client(&mut link).await;
    accept(&link);
    let tree = Subtree::element("button")
        .with_id("save")
        .with_attr("ut-on-click", "")
        .with_attr("ut-optimistic-click", "set-text Saving")
        .with_child(Subtree::text("Save"))
        .to_json()
        .expect("json");
    send(&link, ServerMessage::Control(Control::FullResync { tree }));
    handle.snapshot().await.expect("snapshot");

    assert!(handle.interact(DomEvent::new("save", EventKind::Click { x: 0, y: 0 })));
    assert!(matches!(next_client(&mut link).await, ClientMessage::Event(_)));
    let speculative = handle.snapshot().await.expect("snapshot");
    assert_eq!(speculative.pending_optimistic, 1);

    send(
        &link,
        ServerMessage::Error(ErrorFrame {
            code: 500,
            message: "storage offline".into(),
            fatal: true,
        }),
    );
    assert_eq!(
        handle.next_effect().await,
        Some(Effect::ServerError {
            code: 500,
            message: "storage offline".into(),
            fatal: true,
        })
    );
    assert_eq!(link.recv().await, None);

    let restored = handle.snapshot().await.expect("snapshot");
    assert_eq!(restored.pending_optimistic, 0);
    assert_eq!(
        restored.tree,
        Subtree::fragment(vec![Subtree::element("button")
            .with_id("save")
            .with_attr("ut-on-click", "")
            .with_attr("ut-optimistic-click", "set-text Saving")
            .with_child(Subtree::text("Save"))])
    );

    let mut retry = acceptor.accept().await.expect("reconnect after fatal error");
    assert!(matches!(next_client(&mut retry).await, ClientMessage::Hello(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn heartbeat_pings_carry_wall_clock_time() {
    let (memory, mut acceptor) = memory_endpoint();
    let mut config = config(100, 1_000, 5);
    config.connection.heartbeat_interval = Duration::from_secs(2);
    let handle = renderer::spawn(config, Arc::new(memory));
    let mut link = acceptor.accept().await.expect("link");
    next_client(&mut link).await;
    let before = undertow::protocol::unix_time_ms();
    accept(&link);
    assert!(handle.wait_for(ConnectionState::Connected).await);

    let connected = Instant::now();
    let ClientMessage::Control(Control::Ping { timestamp_ms }) = next_client(&mut link).await
    else {
        panic!("expected heartbeat ping");
    };
    assert!(Instant::now() - connected <= Duration::from_secs(2));
    assert!(timestamp_ms >= before);
}
