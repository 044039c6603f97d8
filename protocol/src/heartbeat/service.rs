//! Node side of the heartbeat protocol.
//!
//! [`HeartbeatService::run`] keeps one stream open to the aggregator and
//! writes a [`Heartbeat`] every `beat_period`. Any failure drops the stream
//! and the service redials after `reconnect_period` plus a random jitter.
//! A write that cannot finish within `write_timeout` counts as a failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::Multiaddr;
use rand::Rng;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Heartbeat;
use crate::chain::ChainReader;
use crate::codec::{write_frame, CodecError};
use crate::config::{
    HEARTBEAT_PERIOD, HEARTBEAT_PROTOCOL_ID, HEARTBEAT_RECONNECT_JITTER,
    HEARTBEAT_RECONNECT_PERIOD, HEARTBEAT_WRITE_TIMEOUT, PROTOCOL_VERSION,
};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Host, TransportError};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Where the aggregator listens.
    pub aggregator: Multiaddr,
    pub beat_period: Duration,
    pub reconnect_period: Duration,
    /// Upper bound of the random delay added to `reconnect_period`.
    pub reconnect_jitter: Duration,
    /// Longest a single heartbeat write may block before the stream is
    /// dropped and redialed.
    pub write_timeout: Duration,
    pub nickname: String,
    pub miner_address: Option<String>,
    /// Build identifier reported to the aggregator.
    pub commit: String,
}

impl HeartbeatConfig {
    pub fn new(aggregator: Multiaddr, nickname: impl Into<String>) -> Self {
        Self {
            aggregator,
            beat_period: HEARTBEAT_PERIOD,
            reconnect_period: HEARTBEAT_RECONNECT_PERIOD,
            reconnect_jitter: HEARTBEAT_RECONNECT_JITTER,
            write_timeout: HEARTBEAT_WRITE_TIMEOUT,
            nickname: nickname.into(),
            miner_address: None,
            commit: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("aggregator did not accept a heartbeat within {0:?}")]
    Stalled(Duration),
}

/// Periodic heartbeat sender.
pub struct HeartbeatService {
    host: Arc<dyn Host>,
    chain: Arc<dyn ChainReader>,
    config: HeartbeatConfig,
    sent: AtomicU64,
}

impl HeartbeatService {
    pub fn new(host: Arc<dyn Host>, chain: Arc<dyn ChainReader>, config: HeartbeatConfig) -> Self {
        Self {
            host,
            chain,
            config,
            sent: AtomicU64::new(0),
        }
    }

    /// Heartbeats written since start.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// The heartbeat for the current chain head, or `None` before the
    /// chain has one.
    pub fn current_heartbeat(&self) -> Option<Heartbeat> {
        let tip = self.chain.heaviest_tip_set().filter(|t| !t.is_empty())?;
        Some(Heartbeat {
            head: tip.key(),
            height: tip.height,
            nickname: self.config.nickname.clone(),
            miner_address: self.config.miner_address.clone(),
            commit: self.config.commit.clone(),
        })
    }

    /// Runs until `shutdown` fires.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(aggregator = %self.config.aggregator, "heartbeat service started");
        while !shutdown.is_triggered() {
            match self.session(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => warn!(
                    aggregator = %self.config.aggregator,
                    error = %e,
                    "heartbeat session failed"
                ),
            }

            let delay = self.reconnect_delay();
            debug!(?delay, "redialing aggregator after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => break,
            }
        }
        info!(sent = self.sent(), "heartbeat service stopped");
    }

    /// One connection's worth of heartbeats. `Ok` means shutdown.
    async fn session(&self, shutdown: &mut ShutdownSignal) -> Result<(), HeartbeatError> {
        let peer = self.host.connect(&self.config.aggregator).await?;
        let mut stream = self.host.open_stream(peer, HEARTBEAT_PROTOCOL_ID).await?;
        info!(%peer, "heartbeat stream open");

        let mut ticker = tokio::time::interval(self.config.beat_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => return Ok(()),
            }
            let Some(heartbeat) = self.current_heartbeat() else {
                debug!("no chain head yet, skipping heartbeat");
                continue;
            };
            let limit = self.config.write_timeout;
            tokio::select! {
                res = tokio::time::timeout(limit, write_frame(&mut stream, &heartbeat)) => {
                    res.map_err(|_| HeartbeatError::Stalled(limit))??;
                }
                _ = shutdown.wait() => return Ok(()),
            }
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter_ms = self.config.reconnect_jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.reconnect_period + Duration::from_millis(extra)
    }
}
