//! # Shutdown Signal
//!
//! Process-wide cancellation for per-peer tasks, built on a
//! `tokio::sync::watch` channel. The handle flips the flag to `true`;
//! every cloned [`ShutdownSignal`] observes it. Dropping the handle counts
//! as a shutdown too, so a task never outlives the thing that spawned it.

use tokio::sync::watch;

/// Sending half. Owned by the composition root (the node binary or a test).
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiving half. Cheap to clone; hand one to every long-lived task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Creates a linked handle/signal pair.
pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    /// Signals every task holding a [`ShutdownSignal`] to stop.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns a fresh signal linked to this handle.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires. Handy for components run without a
    /// surrounding process (tests, one-off tools).
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the life of the process.
        std::mem::forget(tx);
        Self { rx }
    }

    /// Returns `true` once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested or the handle is gone.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
