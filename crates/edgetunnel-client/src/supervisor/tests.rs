//! Supervisor scenarios against a scripted in-memory edge

use super::*;
use crate::backoff::BackoffConfig;
use crate::dialer::TransportDialer;
use crate::edge_discovery::{EdgeError, EdgeResolver, StaticResolver};
use crate::ingress::UnvalidatedConfig;
use crate::metrics::NoopMetrics;
use crate::orchestrator::ConfigurationFlags;
use crate::protocol_selector::{PercentageFetcher, ProtocolPercent};
use async_trait::async_trait;
use edgetunnel_proto::{
    ConnectionDetails, ConnectionError, ConnectionResponse, Protocol, RegisterConnectionRequest,
    RpcBody, RpcFrame,
};
use edgetunnel_transport::{
    MemoryAcceptor, MemoryConnector, MemoryPeer, TransportConnection, TransportError,
    TransportResult,
};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type RegisterFn =
    dyn Fn(&RegisterConnectionRequest) -> (Duration, ConnectionResponse) + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
enum EdgeEvent {
    Registered {
        conn_index: u8,
        protocol: Protocol,
        addr: SocketAddr,
        connection_id: Uuid,
    },
    Rejected {
        conn_index: u8,
        previous_attempts: u8,
    },
    Unregistered {
        conn_index: u8,
    },
    LocalConfig {
        conn_index: u8,
    },
}

/// Edge side: accepts every dialed connection and answers registration calls
struct MockEdge {
    events: mpsc::UnboundedReceiver<EdgeEvent>,
    peers: Arc<Mutex<HashMap<u8, Arc<MemoryPeer>>>>,
    hangups: Arc<Mutex<HashMap<u8, CancellationToken>>>,
    register_calls: Arc<AtomicUsize>,
}

impl MockEdge {
    fn start(acceptors: Vec<MemoryAcceptor>, register: Arc<RegisterFn>) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let hangups = Arc::new(Mutex::new(HashMap::new()));
        let register_calls = Arc::new(AtomicUsize::new(0));

        for mut acceptor in acceptors {
            let events_tx = events_tx.clone();
            let peers = peers.clone();
            let hangups = hangups.clone();
            let register = register.clone();
            let register_calls = register_calls.clone();
            tokio::spawn(async move {
                while let Some((peer, addr)) = acceptor.accept().await {
                    tokio::spawn(serve_connection(
                        Arc::new(peer),
                        addr,
                        register.clone(),
                        events_tx.clone(),
                        peers.clone(),
                        hangups.clone(),
                        register_calls.clone(),
                    ));
                }
            });
        }

        Self {
            events,
            peers,
            hangups,
            register_calls,
        }
    }

    async fn next_event(&mut self) -> EdgeEvent {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("timed out waiting for the edge")
            .expect("edge stopped")
    }

    fn drain(&mut self) -> Vec<EdgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn drop_connection(&self, conn_index: u8) {
        let peers = self.peers.lock().unwrap();
        peers[&conn_index].close("edge restart");
    }

    /// Finish the control stream of a slot but keep its connection up
    fn end_control_stream(&self, conn_index: u8) {
        let hangups = self.hangups.lock().unwrap();
        hangups[&conn_index].cancel();
    }

    fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    peer: Arc<MemoryPeer>,
    addr: SocketAddr,
    register: Arc<RegisterFn>,
    events: mpsc::UnboundedSender<EdgeEvent>,
    peers: Arc<Mutex<HashMap<u8, Arc<MemoryPeer>>>>,
    hangups: Arc<Mutex<HashMap<u8, CancellationToken>>>,
    register_calls: Arc<AtomicUsize>,
) {
    let Some(mut stream) = peer.accept_control_stream().await else {
        return;
    };
    let protocol = peer.protocol();
    let mut registered_as = None;
    let hangup = CancellationToken::new();

    loop {
        let frame = tokio::select! {
            r = stream.receiver.recv_frame() => match r {
                Ok(Some(frame)) => frame,
                _ => break,
            },
            _ = hangup.cancelled() => {
                // The peer stays in `peers`, so the connection itself remains open
                let _ = stream.sender.finish().await;
                return;
            }
        };
        let reply = match frame.body {
            RpcBody::RegisterConnection(request) => {
                register_calls.fetch_add(1, Ordering::SeqCst);
                let (delay, response) = register(&request);
                tokio::time::sleep(delay).await;

                let conn_index = request.conn_index;
                let event = match &response {
                    ConnectionResponse::ConnectionDetails(details) => {
                        registered_as = Some(conn_index);
                        peers.lock().unwrap().insert(conn_index, peer.clone());
                        hangups.lock().unwrap().insert(conn_index, hangup.clone());
                        EdgeEvent::Registered {
                            conn_index,
                            protocol,
                            addr,
                            connection_id: details.uuid(),
                        }
                    }
                    ConnectionResponse::Error(_) => EdgeEvent::Rejected {
                        conn_index,
                        previous_attempts: request.options.num_previous_attempts,
                    },
                };
                let _ = events.send(event);
                RpcBody::RegisterConnectionResult(response)
            }
            RpcBody::UnregisterConnection => {
                let _ = events.send(EdgeEvent::Unregistered {
                    conn_index: registered_as.unwrap_or(u8::MAX),
                });
                RpcBody::UnregisterConnectionResult
            }
            RpcBody::UpdateLocalConfiguration { .. } => {
                let _ = events.send(EdgeEvent::LocalConfig {
                    conn_index: registered_as.unwrap_or(u8::MAX),
                });
                RpcBody::UpdateLocalConfigurationResult { err: String::new() }
            }
            other => RpcBody::Failed {
                message: format!("unexpected {}", other.method()),
            },
        };

        let frame = RpcFrame {
            id: frame.id,
            body: reply,
        };
        if stream.sender.send_frame(&frame).await.is_err() {
            break;
        }
    }
}

/// Dialer that refuses dials the script says should fail
struct ScriptedDialer {
    inner: TransportDialer,
    fail: Box<dyn Fn(Protocol, SocketAddr) -> bool + Send + Sync>,
    dials: Mutex<Vec<(Protocol, SocketAddr, bool)>>,
}

impl ScriptedDialer {
    fn dials(&self) -> Vec<(Protocol, SocketAddr, bool)> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl EdgeDialer for ScriptedDialer {
    async fn dial(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        let fail = (self.fail)(protocol, addr);
        self.dials.lock().unwrap().push((protocol, addr, !fail));
        if fail {
            return Err(TransportError::ConnectionError(format!(
                "{} ({}): connection refused",
                addr, protocol
            )));
        }
        self.inner.dial(protocol, addr).await
    }
}

struct Harness {
    supervisor: Supervisor,
    edge: MockEdge,
    dialer: Arc<ScriptedDialer>,
}

fn edge_addrs() -> Vec<SocketAddr> {
    vec![
        "198.51.100.1:7844".parse().unwrap(),
        "198.51.100.2:7844".parse().unwrap(),
        "198.51.100.3:7844".parse().unwrap(),
        "198.51.100.4:7844".parse().unwrap(),
    ]
}

fn test_config(ha_connections: u8) -> SupervisorConfig {
    SupervisorConfig::default()
        .with_ha_connections(ha_connections)
        .with_backoff(BackoffConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        })
}

fn accept(remotely_managed: bool) -> (Duration, ConnectionResponse) {
    (
        Duration::ZERO,
        ConnectionResponse::ConnectionDetails(ConnectionDetails::new(
            Uuid::new_v4(),
            "test-location",
            remotely_managed,
        )),
    )
}

fn never_fail(_: Protocol, _: SocketAddr) -> bool {
    false
}

fn harness(
    config: SupervisorConfig,
    register: impl Fn(&RegisterConnectionRequest) -> (Duration, ConnectionResponse)
        + Send
        + Sync
        + 'static,
    fail: impl Fn(Protocol, SocketAddr) -> bool + Send + Sync + 'static,
) -> Harness {
    harness_with(
        config,
        ProtocolSelector::auto("account", None),
        Arc::new(StaticResolver::new(edge_addrs())),
        register,
        fail,
    )
}

fn harness_with(
    config: SupervisorConfig,
    selector: ProtocolSelector,
    resolver: Arc<dyn EdgeResolver>,
    register: impl Fn(&RegisterConnectionRequest) -> (Duration, ConnectionResponse)
        + Send
        + Sync
        + 'static,
    fail: impl Fn(Protocol, SocketAddr) -> bool + Send + Sync + 'static,
) -> Harness {
    let (quic, quic_acceptor) = MemoryConnector::new(Protocol::Quic);
    let (h2, h2_acceptor) = MemoryConnector::new(Protocol::Http2);
    let edge = MockEdge::start(vec![quic_acceptor, h2_acceptor], Arc::new(register));

    let dialer = Arc::new(ScriptedDialer {
        inner: TransportDialer::new()
            .with_connector(Arc::new(quic))
            .with_connector(Arc::new(h2)),
        fail: Box::new(fail),
        dials: Mutex::new(Vec::new()),
    });
    let orchestrator = Orchestrator::new(
        UnvalidatedConfig::default(),
        ConfigurationFlags::new(),
        Arc::new(NoopMetrics),
    )
    .unwrap();

    let supervisor = Supervisor::new(SupervisorParams {
        config,
        auth: TunnelAuth {
            account_tag: "account".to_string(),
            tunnel_secret: b"secret".to_vec(),
        },
        tunnel_id: Uuid::new_v4(),
        options: ConnectionOptions::default(),
        discovery: Arc::new(EdgeDiscovery::new(resolver)),
        selector: Arc::new(selector),
        dialer: dialer.clone(),
        orchestrator: Arc::new(orchestrator),
        metrics: Arc::new(NoopMetrics),
    })
    .unwrap();

    Harness {
        supervisor,
        edge,
        dialer,
    }
}

async fn wait_serving(statuses: &[watch::Receiver<SlotStatus>]) {
    for status in statuses {
        status
            .clone()
            .wait_for(|s| s.state == SlotState::Serving)
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_consumes_budget_then_fails() {
    let h = harness(
        test_config(1),
        |_| {
            (
                Duration::ZERO,
                ConnectionResponse::Error(ConnectionError::retry(
                    "server busy",
                    Some(Duration::from_secs(3)),
                )),
            )
        },
        never_fail,
    );
    let statuses = h.supervisor.slot_statuses();
    let mut edge = h.edge;

    let start = Instant::now();
    let result = h.supervisor.run(CancellationToken::new()).await;

    match result {
        Err(SupervisorError::AllConnectionsFailed { count, first }) => {
            assert_eq!(count, 1);
            assert!(first.contains("server busy"), "{}", first);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // One initial attempt plus five retries, each after the server's 3s delay
    assert_eq!(edge.register_calls(), 6);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    assert_eq!(statuses[0].borrow().state, SlotState::Fatal);

    let attempts: Vec<u8> = edge
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            EdgeEvent::Rejected {
                previous_attempts, ..
            } => Some(previous_attempts),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_dial_failures_fall_back_to_http2() {
    let config = SupervisorConfig {
        max_edge_addr_retries: 2,
        ..test_config(1)
    };
    let h = harness(config, |_| accept(true), |protocol, _| protocol == Protocol::Quic);
    let dialer = h.dialer.clone();
    let mut edge = h.edge;

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    match edge.next_event().await {
        EdgeEvent::Registered {
            conn_index,
            protocol,
            addr,
            ..
        } => {
            assert_eq!(conn_index, 0);
            assert_eq!(protocol, Protocol::Http2);
            assert_eq!(addr, edge_addrs()[2]);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let addrs = edge_addrs();
    assert_eq!(
        dialer.dials(),
        vec![
            (Protocol::Quic, addrs[0], false),
            (Protocol::Quic, addrs[1], false),
            (Protocol::Http2, addrs[2], true),
        ]
    );

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_fallback_is_fatal() {
    let config = SupervisorConfig {
        max_edge_addr_retries: 2,
        ..test_config(1)
    };
    let h = harness(config, |_| accept(true), |_, _| true);
    let dialer = h.dialer.clone();

    let result = h.supervisor.run(CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(SupervisorError::AllConnectionsFailed { count: 1, .. })
    ));

    let protocols: Vec<Protocol> = dialer.dials().into_iter().map(|(p, _, _)| p).collect();
    assert_eq!(
        protocols,
        vec![Protocol::Quic, Protocol::Quic, Protocol::Http2, Protocol::Http2]
    );
    assert_eq!(h.edge.register_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_every_slot_registers_and_reconnect_replaces_entry() {
    let h = harness(test_config(4), |_| accept(true), never_fail);
    let tunnels = h.supervisor.tunnels_for_ha();
    let statuses = h.supervisor.slot_statuses();
    let mut connected = h.supervisor.connected_signal();
    let mut edge = h.edge;

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    assert!(connected.wait().await);
    wait_serving(&statuses).await;

    let snapshot = tunnels.snapshot();
    assert_eq!(snapshot.len(), 4);
    for (index, status) in statuses.iter().enumerate() {
        let id = status.borrow().tunnel_id.unwrap();
        assert_eq!(snapshot[&(index as u8)], id.to_string());
    }
    let before = snapshot[&1].clone();
    edge.drain();

    edge.drop_connection(1);
    let new_id = match edge.next_event().await {
        EdgeEvent::Registered {
            conn_index: 1,
            connection_id,
            ..
        } => connection_id,
        other => panic!("unexpected event: {:?}", other),
    };
    statuses[1]
        .clone()
        .wait_for(|s| s.state == SlotState::Serving && s.tunnel_id == Some(new_id))
        .await
        .unwrap();

    let snapshot = tunnels.snapshot();
    assert_eq!(snapshot.len(), 4);
    assert_eq!(snapshot[&1], new_id.to_string());
    assert_ne!(snapshot[&1], before);

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Ok(()));

    let mut unregistered = BTreeSet::new();
    for _ in 0..4 {
        match edge.next_event().await {
            EdgeEvent::Unregistered { conn_index } => {
                unregistered.insert(conn_index);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(unregistered, BTreeSet::from([0, 1, 2, 3]));
}

#[tokio::test(start_paused = true)]
async fn test_ended_control_stream_reregisters_on_open_connection() {
    let h = harness(test_config(1), |_| accept(true), never_fail);
    let statuses = h.supervisor.slot_statuses();
    let tunnels = h.supervisor.tunnels_for_ha();
    let mut edge = h.edge;

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    let first = match edge.next_event().await {
        EdgeEvent::Registered {
            conn_index: 0,
            connection_id,
            ..
        } => connection_id,
        other => panic!("unexpected event: {:?}", other),
    };
    wait_serving(&statuses).await;

    let ended = Instant::now();
    edge.end_control_stream(0);

    let second = match edge.next_event().await {
        EdgeEvent::Registered {
            conn_index: 0,
            connection_id,
            ..
        } => connection_id,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_ne!(first, second);
    // Treated as a lost connection, so the first backoff step applies
    assert!(ended.elapsed() >= Duration::from_secs(1));

    statuses[0]
        .clone()
        .wait_for(|s| s.state == SlotState::Serving && s.tunnel_id == Some(second))
        .await
        .unwrap();
    assert_eq!(tunnels.snapshot()[&0], second.to_string());

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_dials_recycle_addresses_before_fallback() {
    let start = Instant::now();
    let flaky = edge_addrs()[2];
    // Slot 2 starts on the flaky address; every dial after that fails until 5s
    let h = harness(test_config(4), |_| accept(true), move |_, addr| {
        let elapsed = start.elapsed();
        addr == flaky || (elapsed >= Duration::from_millis(500) && elapsed < Duration::from_secs(5))
    });
    let statuses = h.supervisor.slot_statuses();
    let dialer = h.dialer.clone();
    let mut edge = h.edge;

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    // Slot 2 fails at 0s, 1s and 3s, then succeeds at 7s on the address after
    let mut slot_two = None;
    for _ in 0..4 {
        if let EdgeEvent::Registered {
            conn_index: 2,
            protocol,
            addr,
            ..
        } = edge.next_event().await
        {
            slot_two = Some((protocol, addr));
        }
    }
    assert_eq!(slot_two, Some((Protocol::Quic, edge_addrs()[1])));
    assert!(start.elapsed() >= Duration::from_secs(7));

    wait_serving(&statuses).await;
    assert_eq!(statuses[2].borrow().protocol, Some(Protocol::Quic));
    for index in [0, 1, 3] {
        assert_eq!(statuses[index].borrow().protocol, Some(Protocol::Quic));
    }

    let failed: Vec<SocketAddr> = dialer
        .dials()
        .into_iter()
        .filter(|(_, _, ok)| !ok)
        .map(|(_, addr, _)| addr)
        .collect();
    let addrs = edge_addrs();
    assert_eq!(failed, vec![addrs[2], addrs[3], addrs[0]]);
    assert!(dialer.dials().iter().all(|(p, _, _)| *p == Protocol::Quic));

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_rejection_is_fatal_without_backoff() {
    let h = harness(
        test_config(1),
        |_| {
            (
                Duration::ZERO,
                ConnectionResponse::Error(ConnectionError::fatal("duplicate connection")),
            )
        },
        never_fail,
    );
    let statuses = h.supervisor.slot_statuses();

    let start = Instant::now();
    let result = h.supervisor.run(CancellationToken::new()).await;

    match result {
        Err(SupervisorError::AllConnectionsFailed { count, first }) => {
            assert_eq!(count, 1);
            assert!(first.contains("duplicate connection"), "{}", first);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(h.edge.register_calls(), 1);
    assert!(start.elapsed() < Duration::from_secs(1));

    let status = statuses[0].borrow().clone();
    assert_eq!(status.state, SlotState::Fatal);
    assert_eq!(status.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_stops_the_tunnel() {
    let h = harness(
        test_config(2),
        |_| {
            (
                Duration::ZERO,
                ConnectionResponse::Error(ConnectionError::fatal(
                    "Unauthorized: invalid tunnel secret",
                )),
            )
        },
        never_fail,
    );

    let result = h.supervisor.run(CancellationToken::new()).await;
    match result {
        Err(SupervisorError::AuthenticationFailed(cause)) => {
            assert!(cause.contains("Unauthorized"), "{}", cause)
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_targeted_reconnect_waits_requested_delay() {
    let h = harness(test_config(3), |_| accept(true), never_fail);
    let statuses = h.supervisor.slot_statuses();
    let reconnect = h.supervisor.reconnect_sender();
    let mut edge = h.edge;

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    wait_serving(&statuses).await;
    edge.drain();
    let untouched = statuses[0].borrow().tunnel_id;

    let requested = Instant::now();
    reconnect
        .send(ReconnectSignal::slot(1, Duration::from_secs(2)))
        .unwrap();

    // No unregister for a reconnect; the slot comes straight back
    match edge.next_event().await {
        EdgeEvent::Registered { conn_index, .. } => assert_eq!(conn_index, 1),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(requested.elapsed() >= Duration::from_secs(2));
    assert_eq!(statuses[0].borrow().tunnel_id, untouched);

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_lets_registration_finish() {
    let config = test_config(1).with_grace_period(Duration::from_secs(5));
    let h = harness(
        config,
        |_| {
            let (_, response) = accept(true);
            (Duration::from_secs(1), response)
        },
        never_fail,
    );
    let mut edge = h.edge;

    let start = Instant::now();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    assert_eq!(run.await.unwrap(), Ok(()));
    assert!(start.elapsed() < Duration::from_secs(5));

    assert!(matches!(
        edge.next_event().await,
        EdgeEvent::Registered { conn_index: 0, .. }
    ));
    assert_eq!(
        edge.next_event().await,
        EdgeEvent::Unregistered { conn_index: 0 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_expiry_forces_shutdown() {
    let config = test_config(1).with_grace_period(Duration::from_secs(2));
    let h = harness(
        config,
        |_| {
            let (_, response) = accept(true);
            (Duration::from_secs(30), response)
        },
        never_fail,
    );

    let start = Instant::now();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    assert_eq!(run.await.unwrap(), Ok(()));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_only_first_slot_pushes_local_config() {
    let h = harness(test_config(2), |_| accept(false), never_fail);
    let statuses = h.supervisor.slot_statuses();
    let mut edge = h.edge;

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    let mut pushes = Vec::new();
    for _ in 0..3 {
        if let EdgeEvent::LocalConfig { conn_index } = edge.next_event().await {
            pushes.push(conn_index);
        }
    }
    assert_eq!(pushes, vec![0]);
    wait_serving(&statuses).await;

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Ok(()));
    assert!(!edge
        .drain()
        .iter()
        .any(|e| matches!(e, EdgeEvent::LocalConfig { .. })));
}

/// Resolver that always fails and counts lookups
#[derive(Default)]
struct FailingResolver {
    calls: AtomicUsize,
}

#[async_trait]
impl EdgeResolver for FailingResolver {
    async fn resolve(&self, _region: Option<&str>) -> Result<Vec<SocketAddr>, EdgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EdgeError::Resolution("no such host".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_resolution_failures_exhaust_retries() {
    let resolver = Arc::new(FailingResolver::default());
    let h = harness_with(
        test_config(1),
        ProtocolSelector::auto("account", None),
        resolver.clone(),
        |_| accept(true),
        never_fail,
    );
    let statuses = h.supervisor.slot_statuses();

    let start = Instant::now();
    let result = h.supervisor.run(CancellationToken::new()).await;

    match result {
        Err(SupervisorError::AllConnectionsFailed { count, first }) => {
            assert_eq!(count, 1);
            assert!(first.contains("Edge discovery failed"), "{}", first);
            assert!(first.contains("no such host"), "{}", first);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // Initial lookup plus five retries spaced 1s, 2s, 4s, 8s and 16s apart
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 6);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(31) && elapsed < Duration::from_secs(32));
    assert_eq!(statuses[0].borrow().state, SlotState::Fatal);
    assert_eq!(h.edge.register_calls(), 0);
    assert!(h.dialer.dials().is_empty());
}

/// Rollout lookup that answers once and then never returns
#[derive(Default)]
struct StallingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl PercentageFetcher for StallingFetcher {
    async fn fetch(&self) -> Result<Vec<ProtocolPercent>, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            std::future::pending::<()>().await;
        }
        Ok(vec![ProtocolPercent {
            protocol: Protocol::Quic,
            percentage: 100,
        }])
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_not_held_up_by_stalled_rollout_lookup() {
    let fetcher = Arc::new(StallingFetcher::default());
    let selector = ProtocolSelector::auto("account", Some(fetcher.clone()))
        .with_refresh_ttl(Duration::from_secs(1));
    let h = harness_with(
        test_config(1).with_grace_period(Duration::ZERO),
        selector,
        Arc::new(StaticResolver::new(edge_addrs())),
        |_| {
            let (_, response) = accept(true);
            (Duration::from_secs(2), response)
        },
        never_fail,
    );
    let mut edge = h.edge;

    let start = Instant::now();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(h.supervisor.run(shutdown.clone()));

    // Registration lands after the lookup went stale, so serving triggers a refresh
    assert!(matches!(
        edge.next_event().await,
        EdgeEvent::Registered { conn_index: 0, .. }
    ));
    while fetcher.calls.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }

    tokio::time::sleep_until(start + Duration::from_secs(3)).await;
    shutdown.cancel();

    assert_eq!(run.await.unwrap(), Ok(()));
    assert!(start.elapsed() < Duration::from_secs(4));
}
