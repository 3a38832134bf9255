//! Process-isolated runtime backed by host processes.
//!
//! Stands in for the hypervisor platform when the shim runs without a
//! utility VM: containers are process groups on the host, execs are real
//! processes. This is also what development and the integration tests drive.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::guest::{
    Container, ContainerRequest, CreatedContainer, GuestProcess, GuestStdio, ProcessRequest,
    ProcessSpec, Runtime,
};
use crate::latch::Latch;
use crate::signals::{GuestFlavor, SignalRequest};

/// Runtime that places every container directly on the host.
pub struct HostRuntime {
    host: Arc<HostContainer>,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self {
            host: Arc::new(HostContainer::host()),
        }
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for HostRuntime {
    async fn create_container(&self, req: &ContainerRequest) -> anyhow::Result<CreatedContainer> {
        debug!(id = %req.id, bundle = %req.bundle.display(), "creating host container");
        Ok(CreatedContainer {
            host: None,
            container: Arc::new(HostContainer::new(&req.id, req.init_spec.clone())),
            flavor: GuestFlavor::Linux,
        })
    }

    fn vm_host(&self) -> Option<Arc<dyn Container>> {
        Some(self.host.clone())
    }
}

/// A "container" that is a process group on the host. The first process
/// created in a grouped container is its init: its process group receives
/// terminate, and its exit terminates the container.
pub struct HostContainer {
    id: String,
    init_spec: ProcessSpec,
    grouped: bool,
    exited: Arc<Latch>,
    init_pgid: Mutex<Option<i32>>,
}

impl HostContainer {
    pub fn new(id: &str, init_spec: ProcessSpec) -> Self {
        Self {
            id: id.to_string(),
            init_spec,
            grouped: true,
            exited: Arc::new(Latch::new()),
            init_pgid: Mutex::new(None),
        }
    }

    /// Ungrouped container for one-shot host commands: processes keep their
    /// own process groups and no init is tracked.
    pub fn host() -> Self {
        Self {
            id: "host".to_string(),
            init_spec: ProcessSpec::default(),
            grouped: false,
            exited: Arc::new(Latch::new()),
            init_pgid: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Container for HostContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn guest_flavor(&self) -> GuestFlavor {
        GuestFlavor::Linux
    }

    async fn start(&self) -> anyhow::Result<()> {
        // Host containers have no separate start step; the init process is
        // the container.
        Ok(())
    }

    async fn create_process(&self, req: ProcessRequest) -> anyhow::Result<Box<dyn GuestProcess>> {
        let spec = req.spec.unwrap_or_else(|| self.init_spec.clone());
        if spec.args.is_empty() {
            anyhow::bail!("process document carries no command");
        }

        let mut cmd = Command::new(&spec.args[0]);
        cmd.args(&spec.args[1..]);
        cmd.env_clear();
        for kv in &spec.env {
            if let Some((key, value)) = kv.split_once('=') {
                cmd.env(key, value);
            }
        }
        if !spec.cwd.is_empty() {
            cmd.current_dir(&spec.cwd);
        }
        cmd.stdin(if req.stdin { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(if req.stdout { Stdio::piped() } else { Stdio::null() });
        cmd.stderr(if req.stderr { Stdio::piped() } else { Stdio::null() });

        let mut pgid = self.init_pgid.lock().await;
        if self.grouped {
            cmd.process_group(pgid.unwrap_or(0));
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning '{}'", spec.args[0]))?;
        let pid = child.id().context("spawned process has no pid")?;
        let is_init = self.grouped && pgid.is_none();
        if is_init {
            *pgid = Some(pid as i32);
        }
        drop(pgid);

        let stdio = GuestStdio {
            stdin: child.stdin.take().map(|s| Box::new(s) as _),
            stdout: child.stdout.take().map(|s| Box::new(s) as _),
            stderr: child.stderr.take().map(|s| Box::new(s) as _),
        };
        debug!(container = %self.id, pid, "host process spawned");
        let process = HostProcess::new(pid, stdio, child);

        if is_init {
            // The container lives exactly as long as its init process.
            let container_exited = self.exited.clone();
            let process_exited = process.exited.clone();
            tokio::spawn(async move {
                process_exited.wait().await;
                container_exited.signal();
            });
        }
        Ok(Box::new(process))
    }

    async fn wait(&self) {
        self.exited.wait().await;
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        let pgid = *self.init_pgid.lock().await;
        if let Some(pgid) = pgid {
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(e).context("terminating process group"),
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One process on the host, reaped in the background.
pub struct HostProcess {
    pid: u32,
    stdio: Option<GuestStdio>,
    exited: Arc<Latch>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl HostProcess {
    fn new(pid: u32, stdio: GuestStdio, mut child: tokio::process::Child) -> Self {
        let exited = Arc::new(Latch::new());
        let exit_code = Arc::new(Mutex::new(None));
        {
            let exited = exited.clone();
            let exit_code = exit_code.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => exit_code_of(status),
                    Err(e) => {
                        warn!(pid, error = %e, "waiting on host process failed");
                        255
                    }
                };
                *exit_code.lock().await = Some(code);
                exited.signal();
            });
        }
        Self {
            pid,
            stdio: Some(stdio),
            exited,
            exit_code,
        }
    }
}

#[async_trait]
impl GuestProcess for HostProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn take_stdio(&mut self) -> GuestStdio {
        self.stdio.take().unwrap_or_default()
    }

    async fn signal(&self, request: SignalRequest) -> anyhow::Result<bool> {
        let SignalRequest::Posix { signal } = request else {
            anyhow::bail!("host runtime delivers POSIX signals only");
        };
        if self.exited.is_signaled() {
            return Ok(false);
        }
        let sig = Signal::try_from(signal as i32)
            .map_err(|_| anyhow::anyhow!("unsupported signal {signal}"))?;
        match kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e).context("delivering signal"),
        }
    }

    async fn kill(&self) -> anyhow::Result<bool> {
        self.signal(SignalRequest::Posix {
            signal: Signal::SIGKILL as u32,
        })
        .await
    }

    async fn resize_console(&self, _width: u16, _height: u16) -> anyhow::Result<()> {
        anyhow::bail!("host processes expose no remote console")
    }

    async fn wait(&self) {
        self.exited.wait().await;
    }

    async fn exit_code(&self) -> anyhow::Result<i32> {
        (*self.exit_code.lock().await).ok_or_else(|| anyhow::anyhow!("process has not exited"))
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(255)
}
