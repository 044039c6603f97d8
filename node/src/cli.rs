//! # CLI Interface
//!
//! Defines the command-line argument structure for `tipwire-node` using
//! `clap` derive. Every flag can also be set through a `TIPWIRE_*`
//! environment variable.

use std::net::IpAddr;

use clap::{Parser, Subcommand, ValueEnum};
use tipwire_protocol::aggregator::BackpressurePolicy;
use tipwire_protocol::config::{
    DEFAULT_AGGREGATOR_PORT, DEFAULT_API_PORT, DEFAULT_METRICS_PORT, DEFAULT_P2P_PORT,
    EVENT_QUEUE_CAPACITY,
};
use tipwire_protocol::hello::BadGenesisPolicy;
use tipwire_protocol::Multiaddr;

use crate::logging::LogFormat;

/// Tipwire chain-tip gossip node and heartbeat aggregator.
#[derive(Parser, Debug)]
#[command(
    name = "tipwire-node",
    about = "Tipwire hello handshake node and heartbeat aggregator",
    version,
    propagate_version = true
)]
pub struct TipwireCli {
    /// Log output format.
    #[arg(long, global = true, env = "TIPWIRE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a chain node: hello handshake with peers, optional heartbeats.
    Run(RunArgs),
    /// Run the heartbeat aggregator with its HTTP and WebSocket API.
    Aggregate(AggregateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Address to bind listeners on.
    #[arg(long, env = "TIPWIRE_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port for peer-to-peer connections.
    #[arg(long, env = "TIPWIRE_P2P_PORT", default_value_t = DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "TIPWIRE_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Peers to dial on startup, e.g. `/ip4/10.0.0.2/tcp/9740`.
    #[arg(long = "peer", env = "TIPWIRE_PEERS", value_delimiter = ',')]
    pub peers: Vec<Multiaddr>,

    /// Genesis block this node runs on.
    #[arg(long, env = "TIPWIRE_GENESIS")]
    pub genesis: String,

    /// Blocks of the current heaviest tip set.
    #[arg(long, env = "TIPWIRE_HEAD", value_delimiter = ',', required = true)]
    pub head: Vec<String>,

    /// Height of the current heaviest tip set.
    #[arg(long, env = "TIPWIRE_HEIGHT", default_value_t = 0)]
    pub height: u64,

    /// What to do with peers on a different genesis.
    #[arg(long, env = "TIPWIRE_BAD_GENESIS", default_value = "log-only")]
    pub bad_genesis: GenesisPolicyArg,

    /// Aggregator to stream heartbeats to. Heartbeats are off when unset.
    #[arg(long, env = "TIPWIRE_AGGREGATOR")]
    pub aggregator: Option<Multiaddr>,

    /// Name reported in heartbeats.
    #[arg(long, env = "TIPWIRE_NICKNAME", default_value = "tipwire-node")]
    pub nickname: String,

    /// Miner address reported in heartbeats.
    #[arg(long, env = "TIPWIRE_MINER_ADDRESS")]
    pub miner_address: Option<String>,

    /// Seconds between heartbeats.
    #[arg(long, env = "TIPWIRE_BEAT_SECS", default_value_t = 3)]
    pub beat_secs: u64,

    /// Derive the node identity from this seed instead of a random key.
    #[arg(long, env = "TIPWIRE_IDENTITY_SEED")]
    pub identity_seed: Option<u64>,
}

/// Arguments for the `aggregate` subcommand.
#[derive(Parser, Debug)]
pub struct AggregateArgs {
    /// Address to bind listeners on.
    #[arg(long, env = "TIPWIRE_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port monitored nodes connect to.
    #[arg(long, env = "TIPWIRE_AGGREGATOR_PORT", default_value_t = DEFAULT_AGGREGATOR_PORT)]
    pub p2p_port: u16,

    /// Port for the REST and WebSocket API.
    #[arg(long, env = "TIPWIRE_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "TIPWIRE_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Capacity of the event queue between ingestion and the feed.
    #[arg(long, env = "TIPWIRE_QUEUE_CAPACITY", default_value_t = EVENT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Behaviour when the event queue is full.
    #[arg(long, env = "TIPWIRE_BACKPRESSURE", default_value = "block")]
    pub backpressure: BackpressureArg,

    /// Forget nodes when they disconnect.
    #[arg(long, env = "TIPWIRE_PRUNE_ON_DISCONNECT")]
    pub prune_on_disconnect: bool,

    /// Derive the aggregator identity from this seed instead of a random key.
    #[arg(long, env = "TIPWIRE_IDENTITY_SEED")]
    pub identity_seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GenesisPolicyArg {
    LogOnly,
    Disconnect,
}

impl From<GenesisPolicyArg> for BadGenesisPolicy {
    fn from(arg: GenesisPolicyArg) -> Self {
        match arg {
            GenesisPolicyArg::LogOnly => BadGenesisPolicy::LogOnly,
            GenesisPolicyArg::Disconnect => BadGenesisPolicy::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackpressureArg {
    Block,
    DropOldest,
}

impl From<BackpressureArg> for BackpressurePolicy {
    fn from(arg: BackpressureArg) -> Self {
        match arg {
            BackpressureArg::Block => BackpressurePolicy::Block,
            BackpressureArg::DropOldest => BackpressurePolicy::DropOldest,
        }
    }
}
