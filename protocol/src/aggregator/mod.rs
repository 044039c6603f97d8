//! # Aggregator
//!
//! Central collection point for heartbeats from a fleet of nodes.
//!
//! ## Architecture
//!
//! ```text
//! queue.rs   — bounded FIFO between ingestion and the feed
//! tracker.rs — per-node heads, liveness and consensus
//! feed.rs    — queue drain + broadcast to live subscribers
//! mod.rs     — AggregatorService, which wires them to a Host
//! ```
//!
//! ```text
//!   heartbeat stream ─► HeartbeatIngestor ─┬─► Tracker::record_head
//!   heartbeat stream ─► HeartbeatIngestor ─┤        (first)
//!                                          └─► EventQueue ─► EventFeed ─► subscribers
//! ```

pub mod feed;
pub mod queue;
pub mod tracker;

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::Registry;
use tokio::task::JoinHandle;
use tracing::info;

pub use feed::EventFeed;
pub use queue::{BackpressurePolicy, EventQueue, QueueError};
pub use tracker::{
    ConsensusRule, HeadReport, MajorityRule, TrackedNode, Tracker, TrackerConfig, TrackerSnapshot,
};

use crate::config::{EVENT_QUEUE_CAPACITY, FEED_CHANNEL_CAPACITY, HEARTBEAT_PROTOCOL_ID};
use crate::heartbeat::{HeartbeatEvent, HeartbeatIngestor};
use crate::shutdown::ShutdownSignal;
use crate::transport::{stream_handler, Host};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub feed_capacity: usize,
    pub tracker: TrackerConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: EVENT_QUEUE_CAPACITY,
            backpressure: BackpressurePolicy::default(),
            feed_capacity: FEED_CHANNEL_CAPACITY,
            tracker: TrackerConfig::default(),
        }
    }
}

/// Owns the queue, tracker and feed, and attaches them to a host.
pub struct AggregatorService {
    host: Arc<dyn Host>,
    tracker: Arc<Tracker>,
    queue: Arc<EventQueue<HeartbeatEvent>>,
    feed: EventFeed,
    shutdown: ShutdownSignal,
    feed_task: Mutex<Option<JoinHandle<u64>>>,
}

impl AggregatorService {
    /// Builds the components. Tracker metrics go into `registry`.
    pub fn new(
        host: Arc<dyn Host>,
        config: AggregatorConfig,
        registry: &Registry,
        shutdown: ShutdownSignal,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            host,
            tracker: Arc::new(Tracker::new(config.tracker, registry)?),
            queue: Arc::new(EventQueue::new(config.queue_capacity, config.backpressure)),
            feed: EventFeed::new(config.feed_capacity),
            shutdown,
            feed_task: Mutex::new(None),
        })
    }

    /// Registers the heartbeat handler and the tracker's connection
    /// notifiee, then starts draining the queue into the feed.
    pub fn start(&self) {
        let ingestor = HeartbeatIngestor::new(
            Arc::clone(&self.tracker),
            Arc::clone(&self.queue),
            self.shutdown.clone(),
        );
        self.host.set_stream_handler(
            HEARTBEAT_PROTOCOL_ID,
            stream_handler(move |stream| {
                let ingestor = ingestor.clone();
                async move {
                    ingestor.ingest(stream).await;
                }
            }),
        );
        self.host.register_notifiee(self.tracker.clone());

        let feed = self.feed.clone();
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move { feed.run(queue, shutdown).await });
        *self.feed_task.lock() = Some(task);

        info!(
            peer = %self.host.local_peer_id(),
            protocol = HEARTBEAT_PROTOCOL_ID,
            "aggregator started"
        );
    }

    /// Closes the queue. Ingestion tasks stop at their next push; the feed
    /// drains what is left and exits.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    /// [`shutdown`](Self::shutdown), then waits for the feed to finish.
    /// Returns the number of events the feed drained.
    pub async fn stop(&self) -> u64 {
        self.shutdown();
        let task = self.feed_task.lock().take();
        match task {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn feed(&self) -> &EventFeed {
        &self.feed
    }

    pub fn queue(&self) -> &Arc<EventQueue<HeartbeatEvent>> {
        &self.queue
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }
}
