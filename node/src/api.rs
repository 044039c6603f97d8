//! # REST + WebSocket API
//!
//! Builds the axum router that exposes the aggregator's HTTP interface.
//! All endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path           | Description                            |
//! |--------|----------------|----------------------------------------|
//! | GET    | `/health`      | Liveness probe                         |
//! | GET    | `/status`      | Tracker snapshot plus queue/feed state |
//! | GET    | `/nodes/:peer` | One tracked node                       |
//! | GET    | `/ws`          | WebSocket feed of heartbeat events     |

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tipwire_protocol::aggregator::{AggregatorService, TrackerSnapshot};
use tipwire_protocol::PeerId;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The binary's reported version string.
    pub version: String,
    pub aggregator: Arc<AggregatorService>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/nodes/:peer", get(node_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: String,
    pub peer_id: String,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub events_dropped: u64,
    pub feed_subscribers: usize,
    #[serde(flatten)]
    pub tracker: TrackerSnapshot,
    /// RFC 3339 timestamp of the response.
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, msg: impl Into<String>) -> axum::response::Response {
    (status, Json(ErrorBody { error: msg.into() })).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness probe.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let agg = &state.aggregator;
    Json(StatusResponse {
        version: state.version.clone(),
        peer_id: agg.host().local_peer_id().to_string(),
        queue_depth: agg.queue().len(),
        queue_capacity: agg.queue().capacity(),
        events_dropped: agg.queue().dropped(),
        feed_subscribers: agg.feed().subscriber_count(),
        tracker: agg.tracker().snapshot(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /nodes/:peer` — 400 for a malformed id, 404 for an unknown node.
async fn node_handler(
    State(state): State<AppState>,
    Path(peer): Path<String>,
) -> axum::response::Response {
    let peer: PeerId = match peer.parse() {
        Ok(p) => p,
        Err(_) => return error(StatusCode::BAD_REQUEST, format!("invalid peer id: {peer}")),
    };
    match state.aggregator.tracker().node(&peer) {
        Some(node) => Json(node).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown node: {peer}")),
    }
}

/// `GET /ws` — upgrades to a WebSocket that pushes every heartbeat event.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Forwards feed events until the client disconnects or the feed closes.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.aggregator.feed().subscribe();
    state.metrics.ws_clients.inc();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to serialize ws event");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "ws subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    // Push-only channel; client messages are ignored.
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    state.metrics.ws_clients.dec();
}
