//! Cooperative shutdown signal shared by every long-running task.
//!
//! A `watch` channel carries a single boolean: `false` while running,
//! `true` once shutdown is requested. Loops keep a cloned [`Shutdown`]
//! and poll it in their `tokio::select!` arms.

use tokio::sync::watch;

/// Raises the shutdown signal. Held by the supervisor.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Raise the signal. All subscribed loops observe it on their next
    /// suspension point. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Subscriber side of the shutdown signal. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// True once shutdown has been requested.
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when shutdown is requested. Resolves immediately if it
    /// already was. A dropped handle counts as shutdown.
    pub async fn raised(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Create a linked handle/subscriber pair.
pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn raised_resolves_after_trigger() {
        let (handle, mut shutdown) = channel();
        assert!(!shutdown.is_raised());

        let waiter = tokio::spawn(async move {
            shutdown.raised().await;
        });
        handle.trigger();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("raised should resolve")
            .expect("join");
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_shutdown() {
        let (handle, mut shutdown) = channel();
        drop(handle);
        timeout(Duration::from_secs(1), shutdown.raised())
            .await
            .expect("raised should resolve when handle dropped");
    }
}
