//! # Event Queue
//!
//! Bounded FIFO between the heartbeat ingestion tasks (many producers) and
//! the feed drain task (one consumer). What happens when it is full is a
//! [`BackpressurePolicy`] decision.
//!
//! `tokio::sync::mpsc` cannot evict an item that is already queued, which
//! `DropOldest` requires. Both policies therefore share this one queue, and
//! `len`/`dropped` read the same state under either.
//!
//! Waiters use the `Notify::notified()` + `enable()` pattern: the waiter is
//! registered before the state is inspected, so a wakeup sent between the
//! check and the `.await` is never lost. A cancelled `push` or `pop` hands
//! any wakeup it already received on to the next waiter, so both are safe
//! to race against a shutdown signal in `select!`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Wait for room. Nothing is ever dropped, but one slow consumer
    /// stalls every producer.
    #[default]
    Block,
    /// Evict the oldest pending event to make room.
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("event queue is closed")]
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer, single-consumer bounded queue.
pub struct EventQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: BackpressurePolicy,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    /// Creates a queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends `item`, applying the backpressure policy when full.
    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                if self.policy == BackpressurePolicy::DropOldest {
                    state.items.pop_front();
                    state.items.push_back(item);
                    drop(state);
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(dropped_total = total, "event queue full, dropped oldest");
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Removes the oldest event, waiting for one if the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.state.lock().closed {
                return None;
            }

            notified.await;
        }
    }

    /// Non-blocking [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Closes the queue. Pending events can still be popped; further
    /// pushes fail. Every waiter is woken.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Events evicted under [`BackpressurePolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
