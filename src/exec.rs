//! Exec lifecycle: one process inside a container, tracked Created →
//! Running → Exited exactly once.
//!
//! Three fates race on every exec: the process exits, the hosting container
//! exits, or the manager forces an exit. All state transitions are
//! serialized under a per-exec mutex; the exited and process-done edges are
//! one-shot latches so every waiter is released exactly once.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{Result, ShimError};
use crate::events::{EventPublisher, TaskEvent};
use crate::guest::{self, Container, GuestProcess, ProcessRequest, ProcessSpec, UtilityVm};
use crate::latch::Latch;
use crate::relay::IoRelay;
use crate::signals::{self, GuestFlavor, SignalDecision};
use crate::watchdog;

/// Observable lifecycle states of an exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Created,
    Running,
    Exited,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecState::Created => write!(f, "created"),
            ExecState::Running => write!(f, "running"),
            ExecState::Exited => write!(f, "exited"),
        }
    }
}

/// Exit status reported while an exec has not exited.
pub const EXIT_STATUS_UNSET: u32 = 255;

/// Point-in-time view of an exec.
#[derive(Debug, Clone)]
pub struct ExecStatus {
    pub tid: String,
    pub eid: String,
    pub bundle: String,
    pub pid: u32,
    pub state: ExecState,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

struct ExecInner {
    state: ExecState,
    pid: u32,
    exit_status: u32,
    exited_at: Option<DateTime<Utc>>,
    process: Option<Arc<dyn GuestProcess>>,
}

/// One process inside a container. When `eid == tid` this is the init exec
/// and starting it starts the container itself.
pub struct Exec {
    events: EventPublisher,
    tid: String,
    id: String,
    bundle: PathBuf,
    flavor: GuestFlavor,
    host: Option<Arc<UtilityVm>>,
    container: Arc<dyn Container>,
    spec: ProcessSpec,
    io: IoRelay,
    process_done: Latch,
    exited: Latch,
    sl: Mutex<ExecInner>,
}

impl Exec {
    /// Create an exec in the Created state and launch its container-exit
    /// observer. The relay must already be connected upstream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: EventPublisher,
        tid: String,
        host: Option<Arc<UtilityVm>>,
        container: Arc<dyn Container>,
        id: String,
        bundle: PathBuf,
        flavor: GuestFlavor,
        spec: ProcessSpec,
        io: IoRelay,
    ) -> Arc<Self> {
        debug!(tid = %tid, eid = %id, "new exec");
        let exec = Arc::new(Self {
            events,
            tid,
            id,
            bundle,
            flavor,
            host,
            container,
            spec,
            io,
            process_done: Latch::new(),
            exited: Latch::new(),
            sl: Mutex::new(ExecInner {
                state: ExecState::Created,
                pid: 0,
                exit_status: EXIT_STATUS_UNSET,
                exited_at: None,
                process: None,
            }),
        });
        tokio::spawn({
            let exec = exec.clone();
            async move { exec.wait_for_container_exit().await }
        });
        exec
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_id(&self) -> &str {
        &self.tid
    }

    /// True when this exec's id equals the task id.
    pub fn is_init(&self) -> bool {
        self.id == self.tid
    }

    pub async fn pid(&self) -> u32 {
        self.sl.lock().await.pid
    }

    pub async fn state(&self) -> ExecState {
        self.sl.lock().await.state
    }

    pub async fn status(&self) -> ExecStatus {
        let inner = self.sl.lock().await;
        ExecStatus {
            tid: self.tid.clone(),
            eid: self.id.clone(),
            bundle: self.bundle.display().to_string(),
            pid: inner.pid,
            state: inner.state,
            stdin: self.io.stdin_path().to_string(),
            stdout: self.io.stdout_path().to_string(),
            stderr: self.io.stderr_path().to_string(),
            terminal: self.io.terminal(),
            exit_status: inner.exit_status,
            exited_at: inner.exited_at,
        }
    }

    /// Start the exec: for the init exec start the container first, then
    /// launch the process, record the pid, publish the start event and hand
    /// off to the exit observer. Any failure leaves the exec Exited(1).
    pub async fn start(self: Arc<Self>) -> Result<u32> {
        debug!(tid = %self.tid, eid = %self.id, "exec start");
        let mut inner = self.sl.lock().await;
        if inner.state != ExecState::Created {
            return Err(ShimError::InvalidState {
                tid: self.tid.clone(),
                eid: self.id.clone(),
                state: inner.state,
                op: "start",
            });
        }

        if self.is_init() {
            if let Err(e) =
                watchdog::watch(watchdog::SYSCALL_DEADLINE, "container start", async {
                    self.container.start().await
                })
                .await
            {
                self.exit_from_created(&mut inner, 1).await;
                return Err(ShimError::Other(e.context("starting container")));
            }
        }

        // Init on a Linux guest carries its process in the container
        // document; everything else passes the captured spec.
        let pass_spec = !self.is_init() || self.flavor == GuestFlavor::Windows;
        let req = ProcessRequest {
            spec: pass_spec.then(|| self.spec.clone()),
            terminal: self.io.terminal(),
            stdin: !self.io.stdin_path().is_empty(),
            stdout: !self.io.stdout_path().is_empty(),
            stderr: !self.io.stderr_path().is_empty(),
        };
        let mut process = match watchdog::watch(
            watchdog::SYSCALL_DEADLINE,
            "create process",
            async { self.container.create_process(req).await },
        )
        .await
        {
            Ok(process) => process,
            Err(e) => {
                if self.is_init() {
                    if let Err(te) = self.container.terminate().await {
                        warn!(tid = %self.tid, error = %te, "terminating container after start failure");
                    }
                    if let Err(ce) = self.container.close().await {
                        warn!(tid = %self.tid, error = %ce, "closing container after start failure");
                    }
                }
                self.exit_from_created(&mut inner, 1).await;
                return Err(ShimError::Other(e.context("launching process")));
            }
        };

        self.io.attach(process.take_stdio()).await;
        let process: Arc<dyn GuestProcess> = Arc::from(process);
        inner.pid = process.pid();
        inner.process = Some(process.clone());
        inner.state = ExecState::Running;

        // Publish the start event before the exit observer exists so no exit
        // event can ever precede it on the stream.
        if self.is_init() {
            self.events.publish(TaskEvent::Started {
                tid: self.tid.clone(),
                pid: inner.pid,
            });
        } else {
            self.events.publish(TaskEvent::ExecStarted {
                tid: self.tid.clone(),
                eid: self.id.clone(),
                pid: inner.pid,
            });
        }

        let pid = inner.pid;
        tokio::spawn({
            let exec = self.clone();
            async move { exec.wait_for_exit(process).await }
        });
        Ok(pid)
    }

    /// Deliver `signal` to the exec. From Created this is an immediate
    /// Exited(1); from Running the signal is translated against the current
    /// capability and delivered; from Exited the exec is gone.
    pub async fn kill(&self, signal: u32) -> Result<()> {
        debug!(tid = %self.tid, eid = %self.id, signal, "exec kill");
        let mut inner = self.sl.lock().await;
        match inner.state {
            ExecState::Created => {
                self.exit_from_created(&mut inner, 1).await;
                Ok(())
            }
            ExecState::Running => {
                let supported = guest::signals_supported(self.host.as_deref());
                let decision = signals::translate(signal, self.flavor, supported)?;
                let process = running_process(&self.tid, &inner)?;
                let delivered = match decision {
                    SignalDecision::Deliver(request) => {
                        watchdog::watch(watchdog::SYSCALL_DEADLINE, "signal process", async {
                            process.signal(request).await
                        })
                        .await?
                    }
                    SignalDecision::Terminate => {
                        watchdog::watch(watchdog::SYSCALL_DEADLINE, "kill process", async {
                            process.kill().await
                        })
                        .await?
                    }
                };
                if !delivered {
                    return Err(ShimError::NotFound {
                        tid: self.tid.clone(),
                        eid: self.id.clone(),
                    });
                }
                Ok(())
            }
            ExecState::Exited => Err(ShimError::NotFound {
                tid: self.tid.clone(),
                eid: self.id.clone(),
            }),
        }
    }

    /// Forward a terminal resize to the guest process.
    pub async fn resize_pty(&self, width: u32, height: u32) -> Result<()> {
        debug!(tid = %self.tid, eid = %self.id, width, height, "exec resize pty");
        let inner = self.sl.lock().await;
        if inner.state != ExecState::Running {
            return Err(ShimError::InvalidState {
                tid: self.tid.clone(),
                eid: self.id.clone(),
                state: inner.state,
                op: "resizepty",
            });
        }
        if !self.io.terminal() {
            return Err(ShimError::FailedPrecondition(format!(
                "exec '{}' in task '{}' is not a tty",
                self.id, self.tid
            )));
        }
        let process = running_process(&self.tid, &inner)?;
        process.resize_console(width as u16, height as u16).await?;
        Ok(())
    }

    /// Close the upstream stdin endpoint. Idempotent; safe concurrently with
    /// exit.
    pub async fn close_io(&self, _stdin: bool) -> Result<()> {
        debug!(tid = %self.tid, eid = %self.id, "exec close io");
        self.io.close_stdin();
        Ok(())
    }

    /// Block until the exec has exited, then return its status. Never fails;
    /// cancelling the caller leaves the exec untouched.
    pub async fn wait(&self) -> ExecStatus {
        debug!(tid = %self.tid, eid = %self.id, "exec wait");
        self.exited.wait().await;
        self.status().await
    }

    /// Force the exec toward Exited during task shutdown. From Created the
    /// transition happens here; from Running the process is killed so the
    /// exit observer drives the transition.
    pub async fn force_exit(&self, status: u32) {
        let mut inner = self.sl.lock().await;
        if inner.state == ExecState::Exited {
            return;
        }
        debug!(tid = %self.tid, eid = %self.id, status, "exec force exit");
        match inner.state {
            ExecState::Created => self.exit_from_created(&mut inner, status).await,
            ExecState::Running => {
                if let Ok(process) = running_process(&self.tid, &inner) {
                    if let Err(e) = process.kill().await {
                        warn!(tid = %self.tid, eid = %self.id, error = %e, "killing process during force exit");
                    }
                }
            }
            ExecState::Exited => {}
        }
    }

    /// Signaled once the owned process has been observed to terminate, or
    /// once the exec left Created without ever starting.
    pub fn process_done(&self) -> &Latch {
        &self.process_done
    }

    /// Transition Created → Exited. Idempotent; the caller holds the state
    /// lock. No event is published: no start event preceded this exit.
    async fn exit_from_created(&self, inner: &mut ExecInner, status: u32) {
        if inner.state == ExecState::Exited {
            return;
        }
        // Release the container-exit observer first.
        self.process_done.signal();
        inner.state = ExecState::Exited;
        inner.exit_status = status;
        inner.exited_at = Some(Utc::now());
        // Endpoints were never used for copying; this just releases them.
        self.io.close().await;
        self.exited.signal();
    }

    /// Observe the running process until it terminates. Spawned exactly once,
    /// after the transition to Running.
    async fn wait_for_exit(self: Arc<Self>, process: Arc<dyn GuestProcess>) {
        process.wait().await;

        // Release the container-exit observer before anything else; its kill
        // of an already-dead process is handled, but pointless.
        self.process_done.signal();

        let code = match process.exit_code().await {
            Ok(code) => {
                debug!(tid = %self.tid, eid = %self.id, code, "exec exited");
                code
            }
            Err(e) => {
                error!(tid = %self.tid, eid = %self.id, error = %e, "reading exit code");
                0
            }
        };

        let (pid, exit_status, exited_at) = {
            let mut inner = self.sl.lock().await;
            inner.state = ExecState::Exited;
            inner.exit_status = code as u32;
            let exited_at = Utc::now();
            inner.exited_at = Some(exited_at);
            (inner.pid, inner.exit_status, exited_at)
        };

        // Drain pending copies, bounded by the relay's grace window.
        self.io.close().await;

        // The init exec's exit is published by task teardown so it orders
        // with task delete.
        if !self.is_init() {
            self.events.publish(TaskEvent::Exited {
                tid: self.tid.clone(),
                eid: self.id.clone(),
                pid,
                exit_status,
                exited_at,
            });
        }

        self.exited.signal();
    }

    /// Observe the hosting container; launched at construction. Whichever of
    /// container exit and process-done fires first wins; the loser path is a
    /// no-op.
    async fn wait_for_container_exit(self: Arc<Self>) {
        tokio::select! {
            _ = self.container.wait() => {
                let mut inner = self.sl.lock().await;
                match inner.state {
                    ExecState::Created => self.exit_from_created(&mut inner, 1).await,
                    ExecState::Running => {
                        // Kill the process so the exit observer drives the
                        // transition with the real exit code.
                        if let Ok(process) = running_process(&self.tid, &inner) {
                            if let Err(e) = process.kill().await {
                                warn!(tid = %self.tid, eid = %self.id, error = %e, "killing process after container exit");
                            }
                        }
                    }
                    ExecState::Exited => {}
                }
            }
            _ = self.process_done.wait() => {}
        }
    }
}

fn running_process(tid: &str, inner: &ExecInner) -> Result<Arc<dyn GuestProcess>> {
    inner.process.clone().ok_or_else(|| {
        ShimError::Other(anyhow::anyhow!(
            "running exec in task '{tid}' has no process handle"
        ))
    })
}
