//! Aggregator side of the heartbeat protocol: one decode loop per inbound
//! stream.
//!
//! For every record the tracker is updated *before* the event is pushed to
//! the queue, so anything that sees the event at the feed can already read
//! the same head from the tracker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Heartbeat, HeartbeatEvent};
use crate::aggregator::queue::EventQueue;
use crate::aggregator::tracker::Tracker;
use crate::codec::read_frame;
use crate::shutdown::ShutdownSignal;
use crate::transport::Stream;

/// Turns heartbeat streams into tracker updates and queued events.
#[derive(Clone)]
pub struct HeartbeatIngestor {
    tracker: Arc<Tracker>,
    queue: Arc<EventQueue<HeartbeatEvent>>,
    shutdown: ShutdownSignal,
}

impl HeartbeatIngestor {
    pub fn new(
        tracker: Arc<Tracker>,
        queue: Arc<EventQueue<HeartbeatEvent>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            tracker,
            queue,
            shutdown,
        }
    }

    /// Reads heartbeats from `stream` until it closes, fails to decode, or
    /// the process shuts down. Shutdown also interrupts a push blocked on a
    /// full queue. Returns the number of events published.
    pub async fn ingest(&self, mut stream: Stream) -> usize {
        let peer = stream.peer();
        let mut shutdown = self.shutdown.clone();
        let mut last_stamp: Option<DateTime<Utc>> = None;
        let mut published = 0usize;

        info!(%peer, "heartbeat stream opened");
        loop {
            let read = tokio::select! {
                read = read_frame::<_, Heartbeat>(&mut stream) => read,
                _ = shutdown.wait() => {
                    debug!(%peer, "heartbeat stream closed on shutdown");
                    break;
                }
            };

            let heartbeat = match read {
                Ok(Some(hb)) => hb,
                Ok(None) => {
                    debug!(%peer, "heartbeat stream closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "failed to decode heartbeat, closing stream");
                    break;
                }
            };

            // Wall clock can step backwards; per-stream stamps must not.
            let now = Utc::now();
            let received_at = match last_stamp {
                Some(prev) if prev > now => prev,
                _ => now,
            };
            last_stamp = Some(received_at);

            self.tracker.record_head(peer, heartbeat.clone(), received_at);

            let event = HeartbeatEvent {
                from_peer: peer,
                received_at,
                heartbeat,
            };
            let pushed = tokio::select! {
                pushed = self.queue.push(event) => pushed,
                _ = shutdown.wait() => {
                    debug!(%peer, "shutdown while waiting for queue space");
                    break;
                }
            };
            if pushed.is_err() {
                debug!(%peer, "event queue closed, dropping heartbeat stream");
                break;
            }
            published += 1;
        }

        drop(stream);
        info!(%peer, published, "heartbeat stream released");
        published
    }
}
