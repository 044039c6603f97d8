// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tipwire Node
//!
//! Entry point for the `tipwire-node` binary. Parses CLI arguments,
//! initializes logging and metrics, and runs one of:
//!
//! - `run`       — a chain node speaking the hello handshake, optionally
//!   streaming heartbeats to an aggregator
//! - `aggregate` — the heartbeat aggregator with its REST/WS API
//! - `version`   — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use libp2p::identity::Keypair;
use tokio::signal;

use tipwire_protocol::aggregator::{AggregatorConfig, AggregatorService, TrackerConfig};
use tipwire_protocol::chain::{Cid, MemoryChain, TipSet};
use tipwire_protocol::heartbeat::{HeartbeatConfig, HeartbeatService};
use tipwire_protocol::hello::{HelloConfig, HelloProtocol, SyncTrigger};
use tipwire_protocol::shutdown;
use tipwire_protocol::transport::{Host, TcpHost};
use tipwire_protocol::{Multiaddr, PeerId};

use cli::{Commands, TipwireCli};
use metrics::{NodeMetrics, PeerGauge, SharedMetrics};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TipwireCli::parse();

    match cli.command {
        Commands::Run(args) => {
            logging::init_logging(logging::DEFAULT_FILTER, cli.log_format);
            run_node(args).await
        }
        Commands::Aggregate(args) => {
            logging::init_logging(logging::DEFAULT_FILTER, cli.log_format);
            run_aggregator(args).await
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runs a chain node until Ctrl+C / SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let (handle, signal) = shutdown::channel();
    let keypair = node_identity(args.identity_seed)?;
    let peer_id = keypair.public().to_peer_id();

    let p2p_addr = SocketAddr::new(args.bind, args.p2p_port);
    let host = Arc::new(
        TcpHost::bind_with_keypair(p2p_addr, keypair, signal.clone())
            .await
            .with_context(|| format!("failed to bind p2p listener on {p2p_addr}"))?,
    );

    let head = TipSet::new(args.head.iter().map(Cid::new).collect(), args.height);
    let chain = Arc::new(MemoryChain::with_head(Cid::new(&args.genesis), head));

    tracing::info!(
        %peer_id,
        %p2p_addr,
        genesis = %args.genesis,
        height = args.height,
        "starting tipwire-node"
    );

    // --- Metrics ---
    let node_metrics: SharedMetrics =
        Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);
    host.register_notifiee(Arc::new(PeerGauge(Arc::clone(&node_metrics))));

    // --- Hello ---
    let hello = HelloProtocol::new(
        host.clone(),
        chain.clone(),
        sync_trigger(Arc::clone(&node_metrics)),
        HelloConfig {
            bad_genesis: args.bad_genesis.into(),
            ..HelloConfig::default()
        },
        signal.clone(),
    );
    hello.start();

    for addr in &args.peers {
        match host.connect(addr).await {
            Ok(peer) => tracing::info!(%peer, %addr, "connected to bootstrap peer"),
            Err(e) => tracing::warn!(%addr, error = %e, "failed to dial bootstrap peer"),
        }
    }

    // --- Heartbeats ---
    let heartbeat_task = args.aggregator.clone().map(|aggregator| {
        let config = HeartbeatConfig {
            beat_period: Duration::from_secs(args.beat_secs.max(1)),
            miner_address: args.miner_address.clone(),
            ..HeartbeatConfig::new(aggregator, args.nickname.clone())
        };
        let service = HeartbeatService::new(host.clone(), chain.clone(), config);
        let signal = signal.clone();
        tokio::spawn(async move { service.run(signal).await })
    });

    // --- Metrics server ---
    let metrics_router = metrics_router(Arc::clone(&node_metrics));
    let metrics_addr = SocketAddr::new(args.bind, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(%metrics_addr, "metrics server listening");

    tokio::select! {
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    handle.trigger();
    if let Some(task) = heartbeat_task {
        let _ = task.await;
    }
    tracing::info!("tipwire-node stopped");
    Ok(())
}

/// Runs the heartbeat aggregator until Ctrl+C / SIGTERM.
async fn run_aggregator(args: cli::AggregateArgs) -> Result<()> {
    let (handle, signal) = shutdown::channel();
    let keypair = node_identity(args.identity_seed)?;
    let peer_id = keypair.public().to_peer_id();

    let p2p_addr = SocketAddr::new(args.bind, args.p2p_port);
    let host = Arc::new(
        TcpHost::bind_with_keypair(p2p_addr, keypair, signal.clone())
            .await
            .with_context(|| format!("failed to bind aggregator listener on {p2p_addr}"))?,
    );

    let node_metrics: SharedMetrics =
        Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);
    host.register_notifiee(Arc::new(PeerGauge(Arc::clone(&node_metrics))));

    let config = AggregatorConfig {
        queue_capacity: args.queue_capacity,
        backpressure: args.backpressure.into(),
        tracker: TrackerConfig {
            prune_on_disconnect: args.prune_on_disconnect,
        },
        ..AggregatorConfig::default()
    };
    let aggregator = Arc::new(
        AggregatorService::new(host.clone(), config, node_metrics.registry(), signal)
            .context("failed to register tracker metrics")?,
    );
    aggregator.start();

    tracing::info!(
        %peer_id,
        listen = %multiaddr_hint(host.as_ref()),
        queue_capacity = args.queue_capacity,
        backpressure = ?args.backpressure,
        "aggregator ready"
    );

    // --- API server ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        aggregator: Arc::clone(&aggregator),
        metrics: Arc::clone(&node_metrics),
    };
    let api_router = api::create_router(app_state);
    let api_addr = SocketAddr::new(args.bind, args.api_port);
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!(%api_addr, "API server listening");

    // --- Metrics server ---
    let metrics_addr = SocketAddr::new(args.bind, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(%metrics_addr, "metrics server listening");

    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router(Arc::clone(&node_metrics))) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining event queue");
        }
    }

    handle.trigger();
    let drained = aggregator.stop().await;
    tracing::info!(drained, "aggregator stopped");
    Ok(())
}

fn metrics_router(metrics: SharedMetrics) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(metrics)
}

/// Logs accepted peer tips and counts them. The actual chain sync lives
/// outside this binary.
fn sync_trigger(metrics: SharedMetrics) -> Arc<dyn SyncTrigger> {
    Arc::new(move |peer: PeerId, cids: Vec<Cid>, height: u64| {
        metrics.record_peer_tip(height);
        tracing::info!(%peer, height, tip_size = cids.len(), "peer tip received");
    })
}

/// Ed25519 identity, random or derived from `seed`. The transport
/// authenticates peers with this key.
fn node_identity(seed: Option<u64>) -> Result<Keypair> {
    let keypair = match seed {
        Some(seed) => {
            let mut secret = [0u8; 32];
            for chunk in secret.chunks_mut(8) {
                chunk.copy_from_slice(&seed.to_le_bytes());
            }
            Keypair::ed25519_from_bytes(secret).context("invalid identity seed")?
        }
        None => Keypair::generate_ed25519(),
    };
    Ok(keypair)
}

fn multiaddr_hint(host: &dyn Host) -> String {
    host.local_addresses()
        .first()
        .map(Multiaddr::to_string)
        .unwrap_or_default()
}

/// Prints version information to stdout.
fn print_version() {
    println!("tipwire-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", tipwire_protocol::config::PROTOCOL_VERSION);
    println!("hello        {}", tipwire_protocol::config::HELLO_PROTOCOL_ID);
    println!("heartbeat    {}", tipwire_protocol::config::HEARTBEAT_PROTOCOL_ID);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that branch never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
