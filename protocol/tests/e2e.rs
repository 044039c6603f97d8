//! End-to-end tests for the Tipwire protocols.
//!
//! Every test builds its own hosts (in-memory unless it says otherwise), so
//! there is no shared state and no ordering between tests.

use std::sync::Arc;
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use parking_lot::Mutex;
use prometheus::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tipwire_protocol::aggregator::{AggregatorConfig, AggregatorService, BackpressurePolicy};
use tipwire_protocol::chain::{Cid, MemoryChain, TipSet};
use tipwire_protocol::codec::write_frame;
use tipwire_protocol::config::{HEARTBEAT_PROTOCOL_ID, HELLO_PROTOCOL_ID};
use tipwire_protocol::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatIngestor, HeartbeatService};
use tipwire_protocol::hello::{BadGenesisPolicy, HelloConfig, HelloProtocol, SyncTrigger};
use tipwire_protocol::shutdown::{self, ShutdownSignal};
use tipwire_protocol::transport::{stream_handler, Host, MemoryHost, MemoryNetwork, Stream, TcpHost};
use tipwire_protocol::PeerId;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

type Calls = Arc<Mutex<Vec<(PeerId, Vec<Cid>, u64)>>>;

fn recorder() -> (Arc<dyn SyncTrigger>, Calls) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let trigger: Arc<dyn SyncTrigger> = Arc::new(move |p: PeerId, c: Vec<Cid>, h: u64| {
        sink.lock().push((p, c, h));
    });
    (trigger, calls)
}

fn chain(genesis: &str, cids: &[&str], height: u64) -> Arc<MemoryChain> {
    let tip = TipSet::new(cids.iter().map(|c| Cid::from(*c)).collect(), height);
    Arc::new(MemoryChain::with_head(genesis.into(), tip))
}

fn hello_node(
    host: Arc<dyn Host>,
    chain: Arc<MemoryChain>,
    policy: BadGenesisPolicy,
) -> (HelloProtocol, Calls) {
    let (trigger, calls) = recorder();
    let proto = HelloProtocol::new(
        host,
        chain,
        trigger,
        HelloConfig {
            bad_genesis: policy,
            ..HelloConfig::default()
        },
        ShutdownSignal::never(),
    );
    proto.start();
    (proto, calls)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn hb(head: &str, height: u64) -> Heartbeat {
    Heartbeat {
        head: head.into(),
        height,
        nickname: "e2e".into(),
        miner_address: None,
        commit: "test".into(),
    }
}

// ---------------------------------------------------------------------------
// Hello
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shared_genesis_exchanges_tips_both_ways() {
    let net = MemoryNetwork::new();
    let a = net.add_host();
    let b = net.add_host();

    let (_pa, calls_a) = hello_node(
        a.clone(),
        chain("g1", &["c1", "c2"], 5),
        BadGenesisPolicy::LogOnly,
    );
    let (_pb, calls_b) = hello_node(b.clone(), chain("g1", &["d1"], 7), BadGenesisPolicy::LogOnly);

    a.connect(&b.local_addresses()[0]).await.unwrap();

    assert!(wait_until(|| calls_a.lock().len() == 1 && calls_b.lock().len() == 1).await);

    let at_b = calls_b.lock()[0].clone();
    assert_eq!(at_b, (a.local_peer_id(), vec!["c1".into(), "c2".into()], 5));

    let at_a = calls_a.lock()[0].clone();
    assert_eq!(at_a, (b.local_peer_id(), vec!["d1".into()], 7));

    // Exactly once per connection.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls_a.lock().len(), 1);
    assert_eq!(calls_b.lock().len(), 1);
}

#[tokio::test]
async fn different_genesis_never_triggers_sync() {
    let net = MemoryNetwork::new();
    let a = net.add_host();
    let c = net.add_host();

    let (_pa, calls_a) = hello_node(a.clone(), chain("g1", &["c1"], 5), BadGenesisPolicy::LogOnly);
    let (_pc, calls_c) = hello_node(c.clone(), chain("g2", &["x1"], 3), BadGenesisPolicy::LogOnly);

    a.connect(&c.local_addresses()[0]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(calls_a.lock().is_empty());
    assert!(calls_c.lock().is_empty());
    // LogOnly leaves the connection alone.
    assert!(net.is_linked(a.local_peer_id(), c.local_peer_id()));
}

#[tokio::test]
async fn disconnect_policy_drops_bad_genesis_peer() {
    let net = MemoryNetwork::new();
    let a = net.add_host();
    let c = net.add_host();

    let (_pa, _) = hello_node(a.clone(), chain("g1", &["c1"], 5), BadGenesisPolicy::Disconnect);
    let (_pc, _) = hello_node(c.clone(), chain("g2", &["x1"], 3), BadGenesisPolicy::LogOnly);

    a.connect(&c.local_addresses()[0]).await.unwrap();
    assert!(wait_until(|| !net.is_linked(a.local_peer_id(), c.local_peer_id())).await);
}

#[tokio::test]
async fn hello_over_tcp() {
    let (_handle, signal) = shutdown::channel();
    let a = Arc::new(
        TcpHost::bind("127.0.0.1:0".parse().unwrap(), signal.clone())
            .await
            .unwrap(),
    );
    let b = Arc::new(
        TcpHost::bind("127.0.0.1:0".parse().unwrap(), signal)
            .await
            .unwrap(),
    );

    let (_pa, calls_a) = hello_node(
        a.clone(),
        chain("g1", &["c1", "c2"], 5),
        BadGenesisPolicy::LogOnly,
    );
    let (_pb, calls_b) = hello_node(b.clone(), chain("g1", &["d1"], 7), BadGenesisPolicy::LogOnly);

    a.connect(&b.local_addresses()[0]).await.unwrap();

    assert!(wait_until(|| calls_a.lock().len() == 1 && calls_b.lock().len() == 1).await);
    assert_eq!(calls_b.lock()[0].0, a.local_peer_id());
    assert_eq!(calls_b.lock()[0].2, 5);
    assert_eq!(calls_a.lock()[0].0, b.local_peer_id());
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

fn aggregator(
    net: &Arc<MemoryNetwork>,
    config: AggregatorConfig,
) -> (Arc<MemoryHost>, AggregatorService, Registry) {
    let host = net.add_host();
    let registry = Registry::new();
    let svc = AggregatorService::new(host.clone(), config, &registry, ShutdownSignal::never())
        .unwrap();
    svc.start();
    (host, svc, registry)
}

#[tokio::test]
async fn three_heartbeats_then_close_make_three_events() {
    let net = MemoryNetwork::new();
    let (agg_host, svc, _registry) = aggregator(&net, AggregatorConfig::default());
    let mut sub = svc.feed().subscribe();

    let node = net.add_host();
    let peer = node.connect(&agg_host.local_addresses()[0]).await.unwrap();
    let mut stream = node.open_stream(peer, HEARTBEAT_PROTOCOL_ID).await.unwrap();
    for h in 1..=3 {
        write_frame(&mut stream, &hb(&format!("{{c{h}}}"), h)).await.unwrap();
    }
    drop(stream);

    let mut prev = None;
    for h in 1..=3 {
        let ev = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.from_peer, node.local_peer_id());
        assert_eq!(ev.heartbeat.height, h);
        if let Some(p) = prev {
            assert!(ev.received_at >= p);
        }
        prev = Some(ev.received_at);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sub.try_recv().is_err());
    assert_eq!(svc.tracker().snapshot().heartbeats_total, 3);
    assert_eq!(svc.stop().await, 3);
}

#[tokio::test]
async fn tracker_sees_head_before_feed_does() {
    let net = MemoryNetwork::new();
    let (agg_host, svc, _registry) = aggregator(&net, AggregatorConfig::default());
    let mut sub = svc.feed().subscribe();
    let tracker = Arc::clone(svc.tracker());

    let node = net.add_host();
    let peer = node.connect(&agg_host.local_addresses()[0]).await.unwrap();
    let mut stream = node.open_stream(peer, HEARTBEAT_PROTOCOL_ID).await.unwrap();

    for h in 1..=20u64 {
        write_frame(&mut stream, &hb(&format!("{{c{h}}}"), h)).await.unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let node = tracker.node(&ev.from_peer).unwrap();
        let tracked = node.heartbeat.unwrap().height;
        assert!(tracked >= ev.heartbeat.height);
    }
}

#[tokio::test]
async fn consensus_across_a_small_fleet() {
    let net = MemoryNetwork::new();
    let (agg_host, svc, registry) = aggregator(&net, AggregatorConfig::default());
    let addr = agg_host.local_addresses()[0].clone();

    let mut streams = Vec::new();
    for head in ["{x}", "{x}", "{y}"] {
        let node = net.add_host();
        let peer = node.connect(&addr).await.unwrap();
        let mut stream = node.open_stream(peer, HEARTBEAT_PROTOCOL_ID).await.unwrap();
        write_frame(&mut stream, &hb(head, 10)).await.unwrap();
        streams.push((node, stream));
    }

    let tracker = Arc::clone(svc.tracker());
    assert!(wait_until(|| tracker.snapshot().heartbeats_total == 3).await);

    let snap = tracker.snapshot();
    assert_eq!(snap.consensus_head.as_deref(), Some("{x}"));
    assert_eq!((snap.connected, snap.in_consensus, snap.in_dispute), (3, 2, 1));

    let text = {
        use prometheus::Encoder;
        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        String::from_utf8(buf).unwrap()
    };
    assert!(text.contains("tracker_nodes_in_consensus 2"));

    // The dissenter leaves: liveness changes, history stays.
    let (dissenter, _) = &streams[2];
    dissenter.disconnect(agg_host.local_peer_id()).await.unwrap();
    assert!(wait_until(|| tracker.snapshot().connected == 2).await);
    let gone = tracker.node(&dissenter.local_peer_id()).unwrap();
    assert!(!gone.connected);
    assert_eq!(gone.heartbeat.unwrap().head, "{y}");
    assert_eq!(tracker.snapshot().in_dispute, 0);
}

#[tokio::test]
async fn full_queue_holds_ingestion_without_dropping() {
    let net = MemoryNetwork::new();
    let config = AggregatorConfig {
        queue_capacity: 2,
        backpressure: BackpressurePolicy::Block,
        ..AggregatorConfig::default()
    };
    let host = net.add_host();
    let registry = Registry::new();
    // Not started: nothing drains the queue, so wire ingestion by hand.
    let svc = AggregatorService::new(host.clone(), config, &registry, ShutdownSignal::never())
        .unwrap();
    let ingestor = HeartbeatIngestor::new(
        Arc::clone(svc.tracker()),
        Arc::clone(svc.queue()),
        ShutdownSignal::never(),
    );

    let (mut tx, rx) = tokio::io::duplex(4096);
    let peer = PeerId::random();
    let task = tokio::spawn(async move {
        ingestor
            .ingest(Stream::new(peer, HEARTBEAT_PROTOCOL_ID, rx))
            .await
    });
    for h in 1..=3 {
        write_frame(&mut tx, &hb("{x}", h)).await.unwrap();
    }
    drop(tx);

    let queue = Arc::clone(svc.queue());
    assert!(wait_until(|| queue.len() == 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!task.is_finished());

    for h in 1..=3 {
        assert_eq!(queue.pop().await.unwrap().heartbeat.height, h);
    }
    assert_eq!(task.await.unwrap(), 3);
    assert_eq!(queue.dropped(), 0);
}

#[tokio::test]
async fn heartbeat_service_feeds_aggregator() {
    let net = MemoryNetwork::new();
    let (agg_host, svc, _registry) = aggregator(&net, AggregatorConfig::default());
    let mut sub = svc.feed().subscribe();

    let node = net.add_host();
    let node_chain = chain("g1", &["c1", "c2"], 42);
    let config = HeartbeatConfig {
        beat_period: Duration::from_millis(10),
        ..HeartbeatConfig::new(agg_host.local_addresses()[0].clone(), "node-1")
    };
    let sender = Arc::new(HeartbeatService::new(node.clone(), node_chain, config));

    let (handle, signal) = shutdown::channel();
    let task = tokio::spawn({
        let sender = Arc::clone(&sender);
        async move { sender.run(signal).await }
    });

    let ev = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.from_peer, node.local_peer_id());
    assert_eq!(ev.heartbeat.head, "{c1,c2}");
    assert_eq!(ev.heartbeat.height, 42);
    assert_eq!(ev.heartbeat.nickname, "node-1");

    handle.trigger();
    task.await.unwrap();
    let tracked = svc.tracker().node(&node.local_peer_id()).unwrap();
    assert_eq!(tracked.heartbeat.unwrap().height, 42);
}

#[tokio::test]
async fn shutdown_releases_inbound_streams() {
    let net = MemoryNetwork::new();
    let server = net.add_host();
    let (handle, signal) = shutdown::channel();

    let (trigger, calls) = recorder();
    let hello = HelloProtocol::new(
        server.clone(),
        chain("g1", &["c1"], 1),
        trigger,
        HelloConfig::default(),
        signal.clone(),
    );
    hello.start();

    // Nothing drains this queue, so the second heartbeat parks in push.
    let config = AggregatorConfig {
        queue_capacity: 1,
        backpressure: BackpressurePolicy::Block,
        ..AggregatorConfig::default()
    };
    let svc = AggregatorService::new(server.clone(), config, &Registry::new(), signal.clone())
        .unwrap();
    let ingestor =
        HeartbeatIngestor::new(Arc::clone(svc.tracker()), Arc::clone(svc.queue()), signal);
    server.set_stream_handler(
        HEARTBEAT_PROTOCOL_ID,
        stream_handler(move |s: Stream| {
            let ingestor = ingestor.clone();
            async move {
                ingestor.ingest(s).await;
            }
        }),
    );

    let client = net.add_host();
    let peer = client.connect(&server.local_addresses()[0]).await.unwrap();
    let mut hello_stream = client.open_stream(peer, HELLO_PROTOCOL_ID).await.unwrap();
    let mut hb_stream = client.open_stream(peer, HEARTBEAT_PROTOCOL_ID).await.unwrap();
    for h in 1..=3 {
        write_frame(&mut hb_stream, &hb("{x}", h)).await.unwrap();
    }

    let tracker = Arc::clone(svc.tracker());
    assert!(wait_until(|| tracker.snapshot().heartbeats_total == 2).await);
    assert_eq!(svc.queue().len(), 1);

    handle.trigger();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(1), hello_stream.read(&mut buf))
        .await
        .expect("inbound hello must release its stream on shutdown")
        .unwrap();
    assert_eq!(n, 0);
    let n = tokio::time::timeout(Duration::from_secs(1), hb_stream.read(&mut buf))
        .await
        .expect("blocked ingestion must release its stream on shutdown")
        .unwrap();
    assert_eq!(n, 0);

    assert!(calls.lock().is_empty());
    assert_eq!(svc.queue().len(), 1);
}

// ---------------------------------------------------------------------------
// TCP identity
// ---------------------------------------------------------------------------

async fn tcp_aggregator(signal: ShutdownSignal) -> (Arc<TcpHost>, AggregatorService) {
    let host = Arc::new(
        TcpHost::bind("127.0.0.1:0".parse().unwrap(), signal.clone())
            .await
            .unwrap(),
    );
    let svc =
        AggregatorService::new(host.clone(), AggregatorConfig::default(), &Registry::new(), signal)
            .unwrap();
    svc.start();
    (host, svc)
}

#[tokio::test]
async fn tcp_heartbeats_are_keyed_by_the_senders_key() {
    let (handle, signal) = shutdown::channel();
    let (agg_host, svc) = tcp_aggregator(signal.clone()).await;
    let mut sub = svc.feed().subscribe();

    let node = Arc::new(
        TcpHost::bind("127.0.0.1:0".parse().unwrap(), signal.clone())
            .await
            .unwrap(),
    );
    let config = HeartbeatConfig {
        beat_period: Duration::from_millis(20),
        ..HeartbeatConfig::new(agg_host.local_addresses()[0].clone(), "tcp-node")
    };
    let sender = HeartbeatService::new(node.clone(), chain("g1", &["c7"], 7), config);
    let task = tokio::spawn(async move { sender.run(signal).await });

    let ev = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.from_peer, node.local_peer_id());
    assert_eq!(ev.heartbeat.head, "{c7}");

    let snap = svc.tracker().snapshot();
    assert_eq!(snap.nodes.len(), 1);
    assert_eq!(snap.nodes[0].peer, node.local_peer_id());

    handle.trigger();
    task.await.unwrap();
}

#[tokio::test]
async fn raw_tcp_client_cannot_inject_heartbeats() {
    let (_handle, signal) = shutdown::channel();
    let (agg_host, svc) = tcp_aggregator(signal).await;

    let addr = agg_host.local_addresses()[0].clone();
    let mut ip = None;
    let mut port = None;
    for p in addr.iter() {
        match p {
            Protocol::Ip4(v4) => ip = Some(std::net::IpAddr::from(v4)),
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }
    let target = std::net::SocketAddr::new(ip.unwrap(), port.unwrap());

    // Claims someone else's identity in plaintext, then sends heartbeats.
    let victim = PeerId::random();
    let mut raw = tokio::net::TcpStream::connect(target).await.unwrap();
    let claim = serde_json::json!({
        "peer_id": victim.to_string(),
        "protocol": HEARTBEAT_PROTOCOL_ID,
    });
    let _ = write_frame(&mut raw, &claim).await;
    for h in 1..=3 {
        let _ = write_frame(&mut raw, &hb("{forged}", h)).await;
    }
    let _ = raw.flush().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(svc.tracker().node(&victim).is_none());
    assert_eq!(svc.tracker().snapshot().heartbeats_total, 0);
}
