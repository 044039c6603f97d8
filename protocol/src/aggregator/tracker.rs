//! # Consensus Tracker
//!
//! Keeps the last heartbeat of every monitored node and works out which
//! head the fleet agrees on. A node is *in consensus* when its head equals
//! the consensus head and *in dispute* otherwise. Only connected nodes that
//! have reported at least once take part; disconnected nodes keep their
//! history (unless pruning is on) but neither vote nor count as disputing.
//!
//! State sits behind a `parking_lot::RwLock`. `record_head` takes the write
//! lock for the whole recompute, so readers always see a consistent view.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use parking_lot::RwLock;
use prometheus::{IntCounter, IntGauge, Registry};
use serde::Serialize;
use tracing::{debug, info};

use crate::heartbeat::{peer_id_str, Heartbeat};
use crate::transport::ConnectionNotifiee;

// ---------------------------------------------------------------------------
// Consensus Rule
// ---------------------------------------------------------------------------

/// One voting node's report, as seen by a [`ConsensusRule`].
#[derive(Debug, Clone, Copy)]
pub struct HeadReport<'a> {
    pub head: &'a str,
    pub height: u64,
}

/// Decides the consensus head from the heads currently reported.
pub trait ConsensusRule: Send + Sync {
    /// Returns the consensus head, or `None` when there is nothing to agree on.
    fn consensus_head(&self, reports: &[HeadReport<'_>]) -> Option<String>;
}

/// The head reported by the most nodes wins. Ties go to the greater height,
/// then to the lexicographically smaller head.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityRule;

impl ConsensusRule for MajorityRule {
    fn consensus_head(&self, reports: &[HeadReport<'_>]) -> Option<String> {
        // BTreeMap iteration order makes the final tiebreak deterministic.
        let mut tally: BTreeMap<&str, (usize, u64)> = BTreeMap::new();
        for r in reports {
            let entry = tally.entry(r.head).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(r.height);
        }

        let mut best: Option<(&str, usize, u64)> = None;
        for (head, (votes, height)) in tally {
            let better = match best {
                None => true,
                Some((_, bv, bh)) => votes > bv || (votes == bv && height > bh),
            };
            if better {
                best = Some((head, votes, height));
            }
        }
        best.map(|(head, _, _)| head.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tracked State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    /// Forget a node entirely when it disconnects.
    pub prune_on_disconnect: bool,
}

/// Everything the tracker knows about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedNode {
    #[serde(with = "peer_id_str")]
    pub peer: PeerId,
    pub heartbeat: Option<Heartbeat>,
    pub last_seen: Option<DateTime<Utc>>,
    pub connected: bool,
    pub in_consensus: bool,
}

impl TrackedNode {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            heartbeat: None,
            last_seen: None,
            connected: false,
            in_consensus: false,
        }
    }

    fn votes(&self) -> bool {
        self.connected && self.heartbeat.is_some()
    }
}

/// A consistent copy of the tracker state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    pub consensus_head: Option<String>,
    pub connected: usize,
    pub in_consensus: usize,
    pub in_dispute: usize,
    pub heartbeats_total: u64,
    pub nodes: Vec<TrackedNode>,
}

#[derive(Default)]
struct TrackerState {
    nodes: HashMap<PeerId, TrackedNode>,
    consensus_head: Option<String>,
}

struct TrackerMetrics {
    connected: IntGauge,
    in_consensus: IntGauge,
    in_dispute: IntGauge,
    heartbeats: IntCounter,
}

impl TrackerMetrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let connected = IntGauge::new(
            "tracker_connected_nodes",
            "Monitored nodes with a live connection",
        )?;
        registry.register(Box::new(connected.clone()))?;

        let in_consensus = IntGauge::new(
            "tracker_nodes_in_consensus",
            "Connected nodes whose head matches the consensus head",
        )?;
        registry.register(Box::new(in_consensus.clone()))?;

        let in_dispute = IntGauge::new(
            "tracker_nodes_in_dispute",
            "Connected nodes whose head differs from the consensus head",
        )?;
        registry.register(Box::new(in_dispute.clone()))?;

        let heartbeats = IntCounter::new(
            "tracker_heartbeats_total",
            "Heartbeats recorded since startup",
        )?;
        registry.register(Box::new(heartbeats.clone()))?;

        Ok(Self {
            connected,
            in_consensus,
            in_dispute,
            heartbeats,
        })
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Fleet-wide view of node heads and liveness.
pub struct Tracker {
    config: TrackerConfig,
    rule: Arc<dyn ConsensusRule>,
    state: RwLock<TrackerState>,
    metrics: TrackerMetrics,
}

impl Tracker {
    /// Creates a tracker with the [`MajorityRule`], registering its metrics
    /// into `registry`.
    pub fn new(config: TrackerConfig, registry: &Registry) -> prometheus::Result<Self> {
        Self::with_rule(config, Arc::new(MajorityRule), registry)
    }

    pub fn with_rule(
        config: TrackerConfig,
        rule: Arc<dyn ConsensusRule>,
        registry: &Registry,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            config,
            rule,
            state: RwLock::new(TrackerState::default()),
            metrics: TrackerMetrics::register(registry)?,
        })
    }

    /// Stores `heartbeat` as the peer's latest head and recomputes consensus.
    ///
    /// A peer heard from is, by definition, connected.
    pub fn record_head(&self, peer: PeerId, heartbeat: Heartbeat, seen_at: DateTime<Utc>) {
        let mut state = self.state.write();
        let node = state
            .nodes
            .entry(peer)
            .or_insert_with(|| TrackedNode::new(peer));
        node.heartbeat = Some(heartbeat);
        node.last_seen = Some(seen_at);
        node.connected = true;

        self.metrics.heartbeats.inc();
        self.recompute(&mut state);
    }

    pub fn on_peer_connected(&self, peer: PeerId) {
        let mut state = self.state.write();
        state
            .nodes
            .entry(peer)
            .or_insert_with(|| TrackedNode::new(peer))
            .connected = true;
        self.recompute(&mut state);
    }

    pub fn on_peer_disconnected(&self, peer: PeerId) {
        let mut state = self.state.write();
        if self.config.prune_on_disconnect {
            if state.nodes.remove(&peer).is_some() {
                debug!(%peer, "pruned disconnected node");
            }
        } else if let Some(node) = state.nodes.get_mut(&peer) {
            node.connected = false;
        }
        self.recompute(&mut state);
    }

    pub fn node(&self, peer: &PeerId) -> Option<TrackedNode> {
        self.state.read().nodes.get(peer).cloned()
    }

    pub fn consensus_head(&self) -> Option<String> {
        self.state.read().consensus_head.clone()
    }

    /// Nodes are sorted by peer id so repeated snapshots compare cleanly.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.read();
        let mut nodes: Vec<TrackedNode> = state.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.peer.to_string());

        let connected = nodes.iter().filter(|n| n.connected).count();
        let in_consensus = nodes.iter().filter(|n| n.in_consensus).count();
        let in_dispute = nodes.iter().filter(|n| n.votes() && !n.in_consensus).count();

        TrackerSnapshot {
            consensus_head: state.consensus_head.clone(),
            connected,
            in_consensus,
            in_dispute,
            heartbeats_total: self.metrics.heartbeats.get(),
            nodes,
        }
    }

    fn recompute(&self, state: &mut TrackerState) {
        let head = {
            let reports: Vec<HeadReport<'_>> = state
                .nodes
                .values()
                .filter(|n| n.connected)
                .filter_map(|n| n.heartbeat.as_ref())
                .map(|hb| HeadReport {
                    head: &hb.head,
                    height: hb.height,
                })
                .collect();
            self.rule.consensus_head(&reports)
        };

        if head != state.consensus_head {
            info!(
                from = state.consensus_head.as_deref().unwrap_or("-"),
                to = head.as_deref().unwrap_or("-"),
                "consensus head changed"
            );
        }

        let (mut connected, mut agree, mut dispute) = (0i64, 0i64, 0i64);
        for node in state.nodes.values_mut() {
            node.in_consensus =
                node.votes() && node.heartbeat.as_ref().map(|hb| &hb.head) == head.as_ref();
            if node.connected {
                connected += 1;
            }
            if node.in_consensus {
                agree += 1;
            } else if node.votes() {
                dispute += 1;
            }
        }
        state.consensus_head = head;

        self.metrics.connected.set(connected);
        self.metrics.in_consensus.set(agree);
        self.metrics.in_dispute.set(dispute);
    }
}

impl ConnectionNotifiee for Tracker {
    fn connected(&self, peer: PeerId) {
        self.on_peer_connected(peer);
    }

    fn disconnected(&self, peer: PeerId) {
        self.on_peer_disconnected(peer);
    }
}
