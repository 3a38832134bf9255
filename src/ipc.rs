//! Framed IPC serving loop.
//!
//! The supervising manager connects over a Unix socket and sends
//! length-prefixed request frames (4-byte big-endian length, then an
//! encoded [`proto::Envelope`]); every frame gets exactly one
//! [`proto::Reply`] back on the same connection.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::proto;
use crate::service::TaskService;

/// Frames above this size are rejected before allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub struct IpcServer {
    listener: UnixListener,
    service: Arc<TaskService>,
}

impl IpcServer {
    pub fn bind(path: &Path, service: Arc<TaskService>) -> anyhow::Result<Self> {
        // Remove a stale socket from a previous run.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "task service listening");
        Ok(Self { listener, service })
    }

    /// Accept connections until the service reports Shutdown was served.
    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.service.wait_stopped() => {
                    info!("shutdown served, stopping listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service).await {
                            debug!(error = %e, "connection closed");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    service: Arc<TaskService>,
) -> anyhow::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let envelope = proto::Envelope::decode(frame.as_slice())?;
        let reply = service.clone().dispatch(envelope).await;
        write_frame(&mut stream, &reply.encode_to_vec()).await?;
    }
}

/// Read one length-prefixed frame; `None` on a clean end of stream.
pub async fn read_frame<S>(stream: &mut S) -> anyhow::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit");
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        anyhow::bail!(
            "frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
            payload.len()
        );
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}
