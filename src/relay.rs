//! Stdio relay between upstream endpoints and the guest process.
//!
//! The upstream side (the manager's endpoints) is connected before the exec
//! exists; the guest side attaches when the process launches. On close, the
//! pending copies get a bounded grace window to drain before they are
//! abandoned and the endpoints released.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::guest::GuestStdio;
use crate::latch::Latch;

/// Grace window for draining pending copies when the relay closes.
pub const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Client-side endpoints handed to the relay at construction.
#[derive(Default)]
pub struct UpstreamIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Sync + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
    pub stdin_path: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub terminal: bool,
}

struct RelayInner {
    stdin: Option<Box<dyn AsyncRead + Send + Sync + Unpin>>,
    stdout: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
    stderr: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
    pumps: JoinSet<()>,
    closed: bool,
}

/// Relay owned by exactly one exec.
pub struct IoRelay {
    stdin_path: String,
    stdout_path: String,
    stderr_path: String,
    terminal: bool,
    stdin_gate: Arc<Latch>,
    inner: Mutex<RelayInner>,
}

impl IoRelay {
    pub fn from_upstream(upstream: UpstreamIo) -> Self {
        Self {
            stdin_path: upstream.stdin_path,
            stdout_path: upstream.stdout_path,
            stderr_path: upstream.stderr_path,
            terminal: upstream.terminal,
            stdin_gate: Arc::new(Latch::new()),
            inner: Mutex::new(RelayInner {
                stdin: upstream.stdin,
                stdout: upstream.stdout,
                stderr: upstream.stderr,
                pumps: JoinSet::new(),
                closed: false,
            }),
        }
    }

    /// Relay with no endpoints at all.
    pub fn null() -> Self {
        Self::from_upstream(UpstreamIo::default())
    }

    /// Connect the named endpoints. Empty paths stay unconnected.
    pub async fn open(
        stdin: &str,
        stdout: &str,
        stderr: &str,
        terminal: bool,
    ) -> anyhow::Result<Self> {
        let up_stdin: Option<Box<dyn AsyncRead + Send + Sync + Unpin>> = if stdin.is_empty() {
            None
        } else {
            Some(Box::new(tokio::fs::File::open(stdin).await?))
        };
        let up_stdout: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>> = if stdout.is_empty() {
            None
        } else {
            Some(Box::new(open_sink(stdout).await?))
        };
        let up_stderr: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>> = if stderr.is_empty() {
            None
        } else {
            Some(Box::new(open_sink(stderr).await?))
        };
        Ok(Self::from_upstream(UpstreamIo {
            stdin: up_stdin,
            stdout: up_stdout,
            stderr: up_stderr,
            stdin_path: stdin.to_string(),
            stdout_path: stdout.to_string(),
            stderr_path: stderr.to_string(),
            terminal,
        }))
    }

    pub fn stdin_path(&self) -> &str {
        &self.stdin_path
    }

    pub fn stdout_path(&self) -> &str {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &str {
        &self.stderr_path
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    /// Spawn the copy pumps between the upstream endpoints and the guest
    /// process streams.
    pub async fn attach(&self, mut stdio: GuestStdio) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        if let (Some(mut up), Some(mut guest)) = (inner.stdin.take(), stdio.stdin.take()) {
            let gate = self.stdin_gate.clone();
            inner.pumps.spawn(async move {
                tokio::select! {
                    res = tokio::io::copy(&mut up, &mut guest) => match res {
                        Ok(n) => debug!(bytes = n, "stdin copy finished"),
                        Err(e) => debug!(error = %e, "stdin copy failed"),
                    },
                    _ = gate.wait() => {}
                }
                let _ = guest.shutdown().await;
            });
        }
        if let (Some(mut up), Some(mut guest)) = (inner.stdout.take(), stdio.stdout.take()) {
            inner.pumps.spawn(async move {
                match tokio::io::copy(&mut guest, &mut up).await {
                    Ok(n) => debug!(bytes = n, "stdout copy finished"),
                    Err(e) => debug!(error = %e, "stdout copy failed"),
                }
                let _ = up.flush().await;
            });
        }
        if let (Some(mut up), Some(mut guest)) = (inner.stderr.take(), stdio.stderr.take()) {
            inner.pumps.spawn(async move {
                match tokio::io::copy(&mut guest, &mut up).await {
                    Ok(n) => debug!(bytes = n, "stderr copy finished"),
                    Err(e) => debug!(error = %e, "stderr copy failed"),
                }
                let _ = up.flush().await;
            });
        }
    }

    /// Close the upstream stdin endpoint. Safe to call repeatedly and
    /// concurrently with exit; the guest-side stdin closes when the copy
    /// stops.
    pub fn close_stdin(&self) {
        self.stdin_gate.signal();
    }

    /// Drain pending copies within the grace window, then release every
    /// endpoint. Abandoned copies are aborted.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.stdin_gate.signal();
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while inner.pumps.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = DRAIN_GRACE.as_secs(),
                "io copies did not drain within the grace window; abandoning"
            );
            inner.pumps.abort_all();
        }
        inner.stdin = None;
        inner.stdout = None;
        inner.stderr = None;
    }
}

async fn open_sink(path: &str) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    fn boxed_reader<R: AsyncRead + Send + Sync + Unpin + 'static>(
        r: R,
    ) -> Option<Box<dyn AsyncRead + Send + Sync + Unpin>> {
        Some(Box::new(r))
    }

    fn boxed_writer<W: AsyncWrite + Send + Sync + Unpin + 'static>(
        w: W,
    ) -> Option<Box<dyn AsyncWrite + Send + Sync + Unpin>> {
        Some(Box::new(w))
    }

    #[tokio::test]
    async fn pumps_stdout_to_upstream() {
        let (guest_out_tx, guest_out_rx) = duplex(64);
        let (up_out_tx, mut up_out_rx) = duplex(64);
        let relay = IoRelay::from_upstream(UpstreamIo {
            stdout: boxed_writer(up_out_tx),
            ..UpstreamIo::default()
        });
        relay
            .attach(GuestStdio {
                stdout: boxed_reader(guest_out_rx),
                ..GuestStdio::default()
            })
            .await;

        let mut guest = guest_out_tx;
        guest.write_all(b"hello").await.unwrap();
        drop(guest);
        relay.close().await;

        let mut got = Vec::new();
        up_out_rx.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn close_stdin_is_idempotent_and_closes_guest_side() {
        let (_up_in_tx, up_in_rx) = duplex(64);
        let (guest_in_tx, mut guest_in_rx) = duplex(64);
        let relay = IoRelay::from_upstream(UpstreamIo {
            stdin: boxed_reader(up_in_rx),
            ..UpstreamIo::default()
        });
        relay
            .attach(GuestStdio {
                stdin: boxed_writer(guest_in_tx),
                ..GuestStdio::default()
            })
            .await;

        relay.close_stdin();
        relay.close_stdin();

        // Guest stdin reaches EOF once the copy stops.
        let mut buf = Vec::new();
        guest_in_rx.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        relay.close().await;
    }

    #[tokio::test]
    async fn close_abandons_stuck_copies() {
        // The guest stdout stream never ends, so the copy can only be
        // abandoned once the grace window elapses.
        let (guest_out_tx, guest_out_rx) = duplex(64);
        let (up_out_tx, _up_out_rx) = duplex(64);
        let relay = IoRelay::from_upstream(UpstreamIo {
            stdout: boxed_writer(up_out_tx),
            ..UpstreamIo::default()
        });
        relay
            .attach(GuestStdio {
                stdout: boxed_reader(guest_out_rx),
                ..GuestStdio::default()
            })
            .await;
        relay.close().await;
        // A second close is a no-op.
        relay.close().await;
        drop(guest_out_tx);
    }
}
