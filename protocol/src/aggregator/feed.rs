//! # Event Feed
//!
//! Drains the event queue and republishes every event on a broadcast
//! channel. Subscribers that fall more than the channel capacity behind
//! see `RecvError::Lagged` and skip ahead; the drain never waits for them.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use super::queue::EventQueue;
use crate::config::FEED_CHANNEL_CAPACITY;
use crate::heartbeat::HeartbeatEvent;
use crate::shutdown::ShutdownSignal;

/// Broadcast fan-out of heartbeat events.
#[derive(Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<HeartbeatEvent>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(FEED_CHANNEL_CAPACITY)
    }
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a subscriber. It sees every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sends to every live subscriber. Returns how many there were.
    pub fn publish(&self, event: HeartbeatEvent) -> usize {
        // Err only means nobody is listening.
        self.tx.send(event).unwrap_or(0)
    }

    /// Drains `queue` until it is closed and empty, or until shutdown.
    /// Returns the number of events drained.
    pub async fn run(
        &self,
        queue: Arc<EventQueue<HeartbeatEvent>>,
        mut shutdown: ShutdownSignal,
    ) -> u64 {
        info!("event feed started");
        let mut drained = 0u64;
        loop {
            let event = tokio::select! {
                event = queue.pop() => event,
                _ = shutdown.wait() => {
                    debug!("event feed stopping on shutdown");
                    break;
                }
            };
            let Some(event) = event else {
                debug!("event queue closed, feed stopping");
                break;
            };
            drained += 1;
            let receivers = self.publish(event);
            trace!(receivers, "event published");
        }
        info!(drained, "event feed stopped");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::queue::BackpressurePolicy;
    use crate::heartbeat::Heartbeat;
    use chrono::Utc;
    use libp2p::PeerId;
    use tokio::sync::broadcast::error::RecvError;

    fn event(height: u64) -> HeartbeatEvent {
        HeartbeatEvent {
            from_peer: PeerId::random(),
            received_at: Utc::now(),
            heartbeat: Heartbeat {
                head: format!("{{c{height}}}"),
                height,
                nickname: "n".into(),
                miner_address: None,
                commit: "c".into(),
            },
        }
    }

    #[tokio::test]
    async fn drains_to_every_subscriber_in_order() {
        let queue = Arc::new(EventQueue::new(8, BackpressurePolicy::Block));
        let feed = EventFeed::default();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 2);

        for h in 1..=3 {
            queue.push(event(h)).await.unwrap();
        }
        queue.close();

        let drained = feed.run(Arc::clone(&queue), ShutdownSignal::never()).await;
        assert_eq!(drained, 3);

        for h in 1..=3 {
            assert_eq!(a.recv().await.unwrap().heartbeat.height, h);
            assert_eq!(b.recv().await.unwrap().heartbeat.height, h);
        }
    }

    #[tokio::test]
    async fn no_subscribers_still_drains() {
        let queue = Arc::new(EventQueue::new(8, BackpressurePolicy::Block));
        let feed = EventFeed::default();
        queue.push(event(1)).await.unwrap();
        queue.close();
        assert_eq!(feed.run(queue, ShutdownSignal::never()).await, 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_but_drain_completes() {
        let queue = Arc::new(EventQueue::new(16, BackpressurePolicy::Block));
        let feed = EventFeed::new(2);
        let mut slow = feed.subscribe();

        for h in 1..=5 {
            queue.push(event(h)).await.unwrap();
        }
        queue.close();
        assert_eq!(feed.run(queue, ShutdownSignal::never()).await, 5);

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.recv().await.unwrap().heartbeat.height, 4);
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_feed() {
        let queue = Arc::new(EventQueue::new(8, BackpressurePolicy::Block));
        let feed = EventFeed::default();
        let (handle, signal) = crate::shutdown::channel();

        let task = tokio::spawn({
            let feed = feed.clone();
            async move { feed.run(queue, signal).await }
        });
        handle.trigger();
        assert_eq!(task.await.unwrap(), 0);
    }
}
