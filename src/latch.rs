//! One-shot broadcast latch.

use tokio::sync::watch;

/// A latch signaled at most once and observable by many waiters.
///
/// `signal` is idempotent; `wait` returns immediately once the latch has been
/// signaled. Execs use one of these for the exited edge and one for the
/// process-done edge.
#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Signal the latch. Every later call is a no-op.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// Signal the latch, returning true only for the call that actually
    /// signaled it.
    pub fn try_signal(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block until the latch has been signaled.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
