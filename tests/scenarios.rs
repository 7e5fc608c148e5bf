//! Exercises the concrete scenarios enumerated in spec.md §8 directly against the coordinator,
//! using the in-memory transport stand-in so the full admission/handshake/shutdown machinery runs
//! without a real socket or cryptographic handshake.

use std::{
    collections::HashSet,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use overlay_net::{
    backoff::{Backoff, ZeroBackoff},
    config::Config,
    connection::{ConnectionFlags, ConnectionRecord},
    coordinator::{peer_op, Coordinator, Handles},
    discovery::StaticDiscoveryTable,
    events::Event,
    handshake::{self, HandshakeContext},
    identity::{Capability, Contact, NodeId},
    peer::{DisconnectRequest, NoopPeerRunnerSpawner, PeerDropped, PeerInfo, PeerRunnerSpawner},
    persistence::NoopPersistenceSink,
    scheduler::DialScheduler,
    shutdown::Shutdown,
    transport::{
        mock::{MockTransport, Outcome},
        BoxedTransportSocket, Dialer, ProtocolHandshakeOutput, Transport, TransportFactory,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{broadcast, mpsc},
};

lazy_static! {
    /// The capability set every scenario test below advertises as "ours"; shared rather than
    /// rebuilt per test so gate 2's `shares_capability` check always has a stable fixture to
    /// compare against.
    static ref DEFAULT_PROTOCOLS: Vec<Capability> = vec![Capability::new("overlay", 1)];
}

fn default_protocols() -> Vec<Capability> {
    DEFAULT_PROTOCOLS.clone()
}

/// Enables `log` output under `RUST_LOG` when running these tests with `--nocapture`; a no-op
/// otherwise. Harmless to call more than once.
fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config(max_peers: usize, no_max_peers: bool, trusted: HashSet<NodeId>) -> Config {
    Config {
        private_key: vec![1, 2, 3, 4],
        max_peers,
        no_max_peers,
        trusted_nodes: trusted,
        no_dial: true,
        no_discovery: true,
        protocols: default_protocols(),
        ..Config::default()
    }
}

/// A `MockTransport` that reports its close reason over a channel, so tests can observe which
/// connections were rejected and why without inspecting coordinator internals.
struct RecordingTransport {
    inner: MockTransport,
    closed_tx: mpsc::Sender<Option<String>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn do_enc_handshake(&mut self, private_key: &[u8], dial_target: Option<NodeId>) -> Result<NodeId, String> {
        self.inner.do_enc_handshake(private_key, dial_target).await
    }

    async fn do_proto_handshake(
        &mut self,
        our_name: &str,
        our_capabilities: &[Capability],
        expected_identity: NodeId,
    ) -> Result<ProtocolHandshakeOutput, String> {
        self.inner
            .do_proto_handshake(our_name, our_capabilities, expected_identity)
            .await
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, String> {
        self.inner.read_frame().await
    }

    async fn write_frame(&mut self, data: &[u8]) -> Result<(), String> {
        self.inner.write_frame(data).await
    }

    async fn close(&mut self, reason: Option<String>, identity: Option<NodeId>) {
        let _ = self.closed_tx.send(reason.clone()).await;
        self.inner.close(reason, identity).await;
    }
}

/// An encryption handshake delayed by a fixed duration before delegating, used to keep a
/// handshake "in flight" across a shutdown trigger.
struct SlowTransport {
    inner: MockTransport,
    delay: Duration,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn do_enc_handshake(&mut self, private_key: &[u8], dial_target: Option<NodeId>) -> Result<NodeId, String> {
        tokio::time::sleep(self.delay).await;
        self.inner.do_enc_handshake(private_key, dial_target).await
    }

    async fn do_proto_handshake(
        &mut self,
        our_name: &str,
        our_capabilities: &[Capability],
        expected_identity: NodeId,
    ) -> Result<ProtocolHandshakeOutput, String> {
        self.inner
            .do_proto_handshake(our_name, our_capabilities, expected_identity)
            .await
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, String> {
        self.inner.read_frame().await
    }

    async fn write_frame(&mut self, data: &[u8]) -> Result<(), String> {
        self.inner.write_frame(data).await
    }

    async fn close(&mut self, reason: Option<String>, identity: Option<NodeId>) {
        self.inner.close(reason, identity).await;
    }
}

fn inbound_conn(id: NodeId, closed_tx: mpsc::Sender<Option<String>>) -> ConnectionRecord {
    let transport = RecordingTransport {
        inner: MockTransport::new(Outcome::Ok(id), Outcome::Ok((id, default_protocols(), "peer".to_string()))),
        closed_tx,
    };
    ConnectionRecord::new(Box::new(transport), ConnectionFlags::INBOUND, None)
}

/// A socket stand-in for dial-originated connections whose bytes are never actually read or
/// written in these tests — the scripted `Transport` wrapping it answers the handshake directly.
struct NullSocket;

impl AsyncRead for NullSocket {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NullSocket {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct AlwaysConnectsDialer;

#[async_trait]
impl Dialer for AlwaysConnectsDialer {
    async fn dial(&self, _addr: SocketAddr, _timeout: Duration) -> Result<BoxedTransportSocket, String> {
        Ok(Box::new(NullSocket))
    }
}

/// Answers the encryption handshake with the dial target itself and the protocol handshake with a
/// fixed capability set — enough to drive the dial scheduler's path end to end without a real
/// transport.
struct EchoTransport {
    capabilities: Vec<Capability>,
}

#[async_trait]
impl Transport for EchoTransport {
    async fn do_enc_handshake(&mut self, _private_key: &[u8], dial_target: Option<NodeId>) -> Result<NodeId, String> {
        dial_target.ok_or_else(|| "echo transport requires a dial target".to_string())
    }

    async fn do_proto_handshake(
        &mut self,
        _our_name: &str,
        _our_capabilities: &[Capability],
        expected_identity: NodeId,
    ) -> Result<ProtocolHandshakeOutput, String> {
        Ok(ProtocolHandshakeOutput {
            remote_identity: expected_identity,
            remote_capabilities: self.capabilities.clone(),
            remote_name: "remote".to_string(),
            first_frame_at: std::time::Instant::now(),
        })
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, String> {
        Err("echo transport does not support framed I/O".to_string())
    }

    async fn write_frame(&mut self, _data: &[u8]) -> Result<(), String> {
        Err("echo transport does not support framed I/O".to_string())
    }

    async fn close(&mut self, _reason: Option<String>, _identity: Option<NodeId>) {}
}

struct EchoTransportFactory {
    capabilities: Vec<Capability>,
}

impl TransportFactory for EchoTransportFactory {
    fn new_transport(&self, _socket: BoxedTransportSocket) -> Box<dyn Transport> {
        Box::new(EchoTransport {
            capabilities: self.capabilities.clone(),
        })
    }
}

/// A peer runner that reports the peer dropped (as if the remote closed the connection) after a
/// fixed delay, unless asked to disconnect first.
struct DropsAfterDelay {
    delay: Duration,
}

impl PeerRunnerSpawner for DropsAfterDelay {
    fn spawn(
        &self,
        peer_info: PeerInfo,
        _transport: Box<dyn Transport>,
        mut disconnect_rx: mpsc::Receiver<DisconnectRequest>,
        delpeer_tx: mpsc::Sender<PeerDropped>,
    ) {
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = delpeer_tx.send(PeerDropped {
                        node_id: peer_info.node_id,
                        error: Some("remote closed connection".to_string()),
                        remote_requested: true,
                    }).await;
                },
                reason = disconnect_rx.recv() => {
                    let _ = delpeer_tx.send(PeerDropped {
                        node_id: peer_info.node_id,
                        error: reason.map(|r| overlay_net::error::DisconnectReason::from(r).to_string()),
                        remote_requested: false,
                    }).await;
                },
            }
        });
    }
}

/// Everything a test needs to drive handshakes directly against a running coordinator.
struct Harness {
    self_id: NodeId,
    ctx: Arc<HandshakeContext>,
    handles: Handles,
    events_rx: broadcast::Receiver<Event>,
    shutdown: Shutdown,
    join: tokio::task::JoinHandle<()>,
}

fn spawn_harness(
    config: Config,
    dialer: Arc<dyn Dialer>,
    transport_factory: Arc<dyn TransportFactory>,
    peer_runner_spawner: Arc<dyn PeerRunnerSpawner>,
) -> Harness {
    let config = Arc::new(config);
    let self_id = NodeId::random();
    let running = Arc::new(StdMutex::new(true));
    let shutdown = Shutdown::new();
    let quit = shutdown.to_signal();

    let discovery = Arc::new(StaticDiscoveryTable::new(self_id, vec![]));
    let scheduler = DialScheduler::new(
        config.static_nodes.clone(),
        config.dial_target(),
        config.net_restrict.clone(),
        config.blacklist.clone(),
        discovery.clone(),
        Arc::new(ZeroBackoff) as Arc<dyn Backoff>,
    );

    let (handles, receivers) = Coordinator::channels(config.max_dial);

    let ctx = Arc::new(HandshakeContext {
        config: config.clone(),
        self_id,
        running: running.clone(),
        posthandshake_tx: handles.posthandshake_tx.clone(),
        addpeer_tx: handles.addpeer_tx.clone(),
        persistence: Some(Arc::new(NoopPersistenceSink)),
        quit: quit.clone(),
    });

    let (events_tx, events_rx) = broadcast::channel(256);

    let coordinator = Coordinator::new(
        config,
        self_id,
        scheduler,
        dialer,
        transport_factory,
        discovery,
        peer_runner_spawner,
        ctx.clone(),
        events_tx,
        running,
        quit,
        handles.clone(),
        receivers,
    );
    let join = tokio::spawn(coordinator.run());

    Harness {
        self_id,
        ctx,
        handles,
        events_rx,
        shutdown,
        join,
    }
}

fn unused_dialer() -> Arc<dyn Dialer> {
    struct Unused;
    #[async_trait]
    impl Dialer for Unused {
        async fn dial(&self, _addr: SocketAddr, _timeout: Duration) -> Result<BoxedTransportSocket, String> {
            Err("dialing disabled in this test".to_string())
        }
    }
    Arc::new(Unused)
}

fn unused_transport_factory() -> Arc<dyn TransportFactory> {
    struct Unused;
    impl TransportFactory for Unused {
        fn new_transport(&self, _socket: BoxedTransportSocket) -> Box<dyn Transport> {
            panic!("transport factory should not be invoked when dialing is disabled")
        }
    }
    Arc::new(Unused)
}

async fn peer_count(handles: &Handles) -> usize {
    peer_op(&handles.peer_op_tx, |peers| peers.len()).await.unwrap_or(0)
}

async fn has_peer(handles: &Handles, id: NodeId) -> bool {
    peer_op(&handles.peer_op_tx, move |peers| peers.contains_key(&id))
        .await
        .unwrap_or(false)
}

#[tokio::test]
async fn self_dial_rejection() {
    init_test_logging();
    let harness = spawn_harness(
        test_config(10, false, HashSet::new()),
        unused_dialer(),
        unused_transport_factory(),
        Arc::new(NoopPeerRunnerSpawner),
    );

    let (closed_tx, mut closed_rx) = mpsc::channel(1);
    let conn = inbound_conn(harness.self_id, closed_tx);
    handshake::run(conn, harness.ctx.clone()).await;

    assert_eq!(closed_rx.recv().await, Some(Some("self connection".to_string())));
    assert_eq!(peer_count(&harness.handles).await, 0);
}

#[tokio::test]
async fn cap_enforcement() {
    init_test_logging();
    let harness = spawn_harness(
        test_config(2, false, HashSet::new()),
        unused_dialer(),
        unused_transport_factory(),
        Arc::new(NoopPeerRunnerSpawner),
    );

    let a = NodeId::random();
    let b = NodeId::random();
    let c = NodeId::random();

    for id in [a, b] {
        let (closed_tx, _rx) = mpsc::channel(1);
        handshake::run(inbound_conn(id, closed_tx), harness.ctx.clone()).await;
    }
    assert_eq!(peer_count(&harness.handles).await, 2);

    let (closed_tx, mut closed_rx) = mpsc::channel(1);
    handshake::run(inbound_conn(c, closed_tx), harness.ctx.clone()).await;
    assert_eq!(closed_rx.recv().await, Some(Some("too many peers".to_string())));
    assert_eq!(peer_count(&harness.handles).await, 2);
    assert!(has_peer(&harness.handles, a).await);
    assert!(has_peer(&harness.handles, b).await);
}

#[tokio::test]
async fn trusted_bypass() {
    init_test_logging();
    let a = NodeId::random();
    let b = NodeId::random();
    let c = NodeId::random();
    let trusted: HashSet<NodeId> = [c].into_iter().collect();

    let harness = spawn_harness(
        test_config(2, false, trusted),
        unused_dialer(),
        unused_transport_factory(),
        Arc::new(NoopPeerRunnerSpawner),
    );

    for id in [a, b, c] {
        let (closed_tx, _rx) = mpsc::channel(1);
        handshake::run(inbound_conn(id, closed_tx), harness.ctx.clone()).await;
    }

    assert_eq!(peer_count(&harness.handles).await, 3);
    assert!(has_peer(&harness.handles, c).await);
}

#[tokio::test]
async fn duplicate_collapse() {
    init_test_logging();
    let mut harness = spawn_harness(
        test_config(10, false, HashSet::new()),
        unused_dialer(),
        unused_transport_factory(),
        Arc::new(NoopPeerRunnerSpawner),
    );

    let x = NodeId::random();
    let (closed_tx, mut closed_rx) = mpsc::channel(2);

    let ctx_a = harness.ctx.clone();
    let tx_a = closed_tx.clone();
    let a = tokio::spawn(async move { handshake::run(inbound_conn(x, tx_a), ctx_a).await });
    let ctx_b = harness.ctx.clone();
    let tx_b = closed_tx.clone();
    let b = tokio::spawn(async move { handshake::run(inbound_conn(x, tx_b), ctx_b).await });
    drop(closed_tx);

    let _ = tokio::join!(a, b);

    assert_eq!(peer_count(&harness.handles).await, 1);
    assert!(has_peer(&harness.handles, x).await);

    // Exactly one of the two connections loses with "already connected"; the winner is never
    // closed at all, so at most one close reason is ever reported.
    let mut reasons = Vec::new();
    while let Some(reason) = closed_rx.recv().await {
        reasons.push(reason);
    }
    assert_eq!(reasons, vec![Some("already connected".to_string())]);

    // No peer-drop event should have fired for a connection that was never admitted.
    assert!(harness.events_rx.try_recv().is_ok()); // the one PeerAdded
    assert!(matches!(
        harness.events_rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn static_reconnect() {
    init_test_logging();
    let contact = Contact {
        id: NodeId::random(),
        addr: "127.0.0.1:9000".parse::<SocketAddr>().unwrap(),
    };
    let mut config = test_config(10, false, HashSet::new());
    config.no_dial = false;
    config.max_dial = 4;
    config.static_nodes = vec![contact];

    let harness = spawn_harness(
        config,
        Arc::new(AlwaysConnectsDialer),
        Arc::new(EchoTransportFactory {
            capabilities: default_protocols(),
        }),
        Arc::new(DropsAfterDelay {
            delay: Duration::from_millis(100),
        }),
    );

    let deadline = Duration::from_secs(2);

    tokio::time::timeout(deadline, async {
        while !has_peer(&harness.handles, contact.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("static node never connected");

    tokio::time::timeout(deadline, async {
        while has_peer(&harness.handles, contact.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("static node peer never dropped");

    tokio::time::timeout(deadline, async {
        while !has_peer(&harness.handles, contact.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("static node was not redialed after the drop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_static_disconnects_with_requested_and_stops_redial() {
    init_test_logging();
    let contact = Contact {
        id: NodeId::random(),
        addr: "127.0.0.1:9000".parse::<SocketAddr>().unwrap(),
    };
    let mut config = test_config(10, false, HashSet::new());
    config.no_dial = false;
    config.max_dial = 4;
    config.static_nodes = vec![contact];

    // Unlike `static_reconnect`, the peer runner here only drops when asked to — it never
    // self-drops on a timer — so the only way the peer can disappear is the `RemovePeer`
    // round-trip under test (spec.md §8 "`RemovePeer(n)` causes the current peer ... to drop
    // with reason 'requested' and stops further reconnection attempts for n").
    let mut harness = spawn_harness(
        config,
        Arc::new(AlwaysConnectsDialer),
        Arc::new(EchoTransportFactory {
            capabilities: default_protocols(),
        }),
        Arc::new(NoopPeerRunnerSpawner),
    );

    let deadline = Duration::from_secs(2);

    tokio::time::timeout(deadline, async {
        while !has_peer(&harness.handles, contact.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("static node never connected");

    // Drain the `PeerAdded` event emitted above before asserting on the drop that follows.
    assert!(matches!(
        harness.events_rx.recv().await,
        Ok(Event::PeerAdded { peer_id }) if peer_id == contact.id
    ));

    harness
        .handles
        .removestatic_tx
        .send(contact.id)
        .await
        .expect("coordinator still running");

    tokio::time::timeout(deadline, async {
        while has_peer(&harness.handles, contact.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer was not disconnected after RemovePeer");

    match tokio::time::timeout(deadline, harness.events_rx.recv())
        .await
        .expect("no PeerDropped event observed")
        .expect("event channel closed")
    {
        Event::PeerDropped { peer_id, error } => {
            assert_eq!(peer_id, contact.id);
            assert_eq!(error.as_deref(), Some("requested"));
        },
        other => panic!("expected PeerDropped, got {:?}", other),
    }

    // The static set no longer contains `contact`, so the scheduler must not propose a fresh
    // dial task for it even across several scheduling rounds.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!has_peer(&harness.handles, contact.id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_under_load() {
    init_test_logging();
    let harness = spawn_harness(
        test_config(0, true, HashSet::new()),
        unused_dialer(),
        unused_transport_factory(),
        Arc::new(NoopPeerRunnerSpawner),
    );

    let mut handles = Vec::new();
    for _ in 0..50 {
        let id = NodeId::random();
        let ctx = harness.ctx.clone();
        let (closed_tx, _rx) = mpsc::channel(1);
        handles.push(tokio::spawn(async move { handshake::run(inbound_conn(id, closed_tx), ctx).await }));
    }
    for _ in 0..10 {
        let id = NodeId::random();
        let ctx = harness.ctx.clone();
        let transport = SlowTransport {
            inner: MockTransport::new(Outcome::Ok(id), Outcome::Ok((id, default_protocols(), "peer".to_string()))),
            delay: Duration::from_millis(50),
        };
        let conn = ConnectionRecord::new(Box::new(transport), ConnectionFlags::INBOUND, None);
        handles.push(tokio::spawn(async move { handshake::run(conn, ctx).await }));
    }

    // Give the fast connections a moment to be admitted while the slow ten are still mid
    // handshake, then stop with both populations live.
    tokio::time::sleep(Duration::from_millis(5)).await;
    harness.shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(handles))
        .await
        .expect("not all handshake tasks completed after shutdown");

    tokio::time::timeout(Duration::from_secs(2), harness.join)
        .await
        .expect("coordinator did not shut down in time")
        .expect("coordinator task panicked");

    assert_eq!(peer_count(&harness.handles).await, 0);
}
