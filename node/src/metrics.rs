//! # Prometheus Metrics
//!
//! Exposes operational metrics for the node and the aggregator. Scraped by
//! Prometheus at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] with a
//! `tipwire` prefix. The aggregator's tracker registers its own gauges into
//! the same registry.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tipwire_protocol::transport::ConnectionNotifiee;
use tipwire_protocol::PeerId;

/// Holds the binary's own metric handles plus the shared registry.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Peers with a live connection.
    pub connected_peers: IntGauge,
    /// Tips handed to the sync layer by the hello handshake.
    pub peer_tips_received_total: IntCounter,
    /// Highest height any compatible peer has announced.
    pub best_peer_height: IntGauge,
    /// Open WebSocket feed clients.
    pub ws_clients: IntGauge,
}

impl NodeMetrics {
    /// Creates the registry and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("tipwire".into()), None)?;

        let connected_peers =
            IntGauge::new("connected_peers", "Number of currently connected peers")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let peer_tips_received_total = IntCounter::new(
            "peer_tips_received_total",
            "Peer tips accepted by the hello handshake",
        )?;
        registry.register(Box::new(peer_tips_received_total.clone()))?;

        let best_peer_height = IntGauge::new(
            "best_peer_height",
            "Highest tip height announced by a compatible peer",
        )?;
        registry.register(Box::new(best_peer_height.clone()))?;

        let ws_clients = IntGauge::new("ws_clients", "Connected WebSocket feed clients")?;
        registry.register(Box::new(ws_clients.clone()))?;

        Ok(Self {
            registry,
            connected_peers,
            peer_tips_received_total,
            best_peer_height,
            ws_clients,
        })
    }

    /// The registry other components register into.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records a tip accepted from a peer.
    pub fn record_peer_tip(&self, height: u64) {
        self.peer_tips_received_total.inc();
        let height = i64::try_from(height).unwrap_or(i64::MAX);
        if height > self.best_peer_height.get() {
            self.best_peer_height.set(height);
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Keeps `connected_peers` in step with the host's connections.
pub struct PeerGauge(pub SharedMetrics);

impl ConnectionNotifiee for PeerGauge {
    fn connected(&self, _peer: PeerId) {
        self.0.connected_peers.inc();
    }

    fn disconnected(&self, _peer: PeerId) {
        self.0.connected_peers.dec();
    }
}

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
