//! Deadline observer for platform calls.
//!
//! Some platform calls have been observed to never return. The watchdog runs
//! the call on the caller and logs a warning, carrying a per-invocation
//! correlation id, when the deadline passes first. It never cancels the call;
//! the wrapped call has no safe cancellation point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::latch::Latch;

/// Default watchdog deadline for platform calls.
pub const SYSCALL_DEADLINE: Duration = Duration::from_secs(4 * 60);

/// Run `call` to completion while a timer watches it.
pub async fn watch<F>(deadline: Duration, label: &'static str, call: F) -> F::Output
where
    F: Future,
{
    let call_id = Uuid::new_v4();
    debug!(call = label, call_id = %call_id, "watching platform call");

    let done = Arc::new(Latch::new());
    let watcher_done = done.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sleep(deadline) => {
                warn!(
                    call = label,
                    call_id = %call_id,
                    deadline_secs = deadline.as_secs(),
                    "platform call did not complete within the watchdog deadline; \
                     it may be stuck in the platform"
                );
            }
            _ = watcher_done.wait() => {}
        }
    });

    let out = call.await;
    done.signal();
    debug!(call = label, call_id = %call_id, "platform call finished");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_call_output() {
        let out = watch(Duration::from_secs(1), "fast call", async { 7 }).await;
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn never_cancels_a_slow_call() {
        // Deadline fires mid-call; the call still runs to completion.
        let out = watch(Duration::from_millis(5), "slow call", async {
            sleep(Duration::from_millis(50)).await;
            "done"
        })
        .await;
        assert_eq!(out, "done");
    }
}
