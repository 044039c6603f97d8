//! # Protocol Configuration & Constants
//!
//! Every magic number in Tipwire lives here. Protocol identifiers are
//! part of the wire contract: changing one means old and new nodes stop
//! understanding each other, so bump the version suffix instead.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Identifiers
// ---------------------------------------------------------------------------

/// Stream protocol for the one-shot hello handshake.
pub const HELLO_PROTOCOL_ID: &str = "/fil/hello/1.0.0";

/// Stream protocol for persistent heartbeat streams (node → aggregator).
pub const HEARTBEAT_PROTOCOL_ID: &str = "/fil/heartbeat/1.0.0";

/// Crate version, reported in heartbeats as the build commit when no
/// explicit commit string is configured.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// Upper bound for an outbound hello: open stream, write, close.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a monitored node sends a heartbeat.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

/// Base delay before a heartbeat sender redials its aggregator.
pub const HEARTBEAT_RECONNECT_PERIOD: Duration = Duration::from_secs(10);

/// Maximum random jitter added on top of the reconnect delay, so a fleet
/// that lost its aggregator does not redial in lockstep.
pub const HEARTBEAT_RECONNECT_JITTER: Duration = Duration::from_secs(2);

/// Longest a heartbeat write may block before the sender redials.
pub const HEARTBEAT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial timeout for transports that need one. Also bounds stream
/// negotiation on an existing connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a libp2p connection with no open streams stays up.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Capacities
// ---------------------------------------------------------------------------

/// Capacity of the shared aggregator event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// Capacity of the feed's broadcast channel. Subscribers that fall further
/// behind than this skip events.
pub const FEED_CHANNEL_CAPACITY: usize = 256;

/// Largest frame the codec will accept. Hello and heartbeat records are a
/// few hundred bytes; anything near this size is garbage or hostile.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Buffer size of in-memory duplex streams.
pub const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default P2P listening port for `tipwire-node run`.
pub const DEFAULT_P2P_PORT: u16 = 9740;

/// Default HTTP/WS API port of the aggregator.
pub const DEFAULT_API_PORT: u16 = 9741;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9742;

/// Default P2P port the aggregator listens on for heartbeat streams.
pub const DEFAULT_AGGREGATOR_PORT: u16 = 9743;
