// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tipwire Protocol — Core Library
//!
//! The network layer that keeps chain nodes informed of each other's chain
//! tip. Two protocols live here, solving the same problem over different
//! topologies:
//!
//! - **hello** — a one-shot handshake every node runs on every new
//!   connection (mesh). Peers swap tip summaries, check they share a
//!   genesis block and hand the peer's tip to the sync layer.
//! - **heartbeat** + **aggregator** — monitored nodes stream periodic
//!   health reports to a central aggregator (star), which tracks fleet-wide
//!   consensus and fans events out to live dashboards.
//!
//! ## Architecture
//!
//! - **transport** — The `Host` abstraction plus in-memory and TCP hosts.
//! - **codec** — Length-prefixed JSON frames over any async byte stream.
//! - **chain** — Block ids, tip sets and the read-only chain view.
//! - **hello** — The handshake protocol.
//! - **heartbeat** — Heartbeat records, ingestion and the sending service.
//! - **aggregator** — Event queue, consensus tracker, event feed and the
//!   service that wires them together.
//! - **shutdown** — Process-wide cancellation signal.
//! - **config** — Protocol identifiers, timeouts and capacities.
//!
//! ## Design Philosophy
//!
//! 1. One misbehaving peer never takes down another peer's task.
//! 2. No silent drops unless someone configured them.
//! 3. The tracker always sees a head before the dashboards do.

pub mod aggregator;
pub mod chain;
pub mod codec;
pub mod config;
pub mod heartbeat;
pub mod hello;
pub mod shutdown;
pub mod transport;

pub use libp2p::{Multiaddr, PeerId};
