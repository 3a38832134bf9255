//! Task service: RPC dispatch onto the registry and the exec state machines.
//!
//! Every operation runs inside its own worker so a panicking handler
//! surfaces as a transport-level internal error instead of taking the shim
//! down, and every operation emits a begin/end activity log pair. Domain
//! errors map to the transport's canonical codes at this boundary only.

use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use prost::Message;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::diag;
use crate::error::{Result, ShimError};
use crate::events::EventPublisher;
use crate::exec::{Exec, ExecState, ExecStatus};
use crate::guest::{self, ContainerRequest, ProcessSpec, Runtime};
use crate::latch::Latch;
use crate::pod::Pod;
use crate::proto;
use crate::relay::IoRelay;
use crate::task::Task;

pub const SHIM_VERSION: &str = env!("CARGO_PKG_VERSION");

enum TaskOrPod {
    Task(Arc<Task>),
    Pod(Arc<Pod>),
}

/// The dispatcher. Holds the single task (or the pod sandbox) this shim is
/// committed to; the first Create decides which.
pub struct TaskService {
    events: EventPublisher,
    runtime: Arc<dyn Runtime>,
    tid: String,
    is_sandbox: bool,
    state: RwLock<Option<TaskOrPod>>,
    /// Serializes the first Create against all others. Workload containers
    /// in a pod attach without taking it.
    create_lock: Mutex<()>,
    stop: Latch,
}

impl TaskService {
    pub fn new(
        events: EventPublisher,
        runtime: Arc<dyn Runtime>,
        tid: String,
        is_sandbox: bool,
    ) -> Self {
        Self {
            events,
            runtime,
            tid,
            is_sandbox,
            state: RwLock::new(None),
            create_lock: Mutex::new(()),
            stop: Latch::new(),
        }
    }

    /// Resolves once Shutdown has been served.
    pub async fn wait_stopped(&self) {
        self.stop.wait().await;
    }

    // Dispatch plumbing

    /// Serve one request frame. The handler runs on its own worker; a panic
    /// inside it becomes an Unknown reply.
    pub async fn dispatch(self: Arc<Self>, envelope: proto::Envelope) -> proto::Reply {
        let handle = tokio::spawn({
            let service = self.clone();
            async move { service.dispatch_inner(envelope).await }
        });
        match handle.await {
            Ok(reply) => reply,
            Err(join_err) => {
                error!(error = %join_err, "task handler panicked");
                proto::Reply {
                    code: proto::Code::Unknown as i32,
                    error: "internal error in task handler".to_string(),
                    payload: Vec::new(),
                }
            }
        }
    }

    async fn dispatch_inner(&self, envelope: proto::Envelope) -> proto::Reply {
        let unknown_op = || {
            reply_err(&ShimError::InvalidArgument(format!(
                "unknown task op {}",
                envelope.op
            )))
        };
        let op = match proto::TaskOp::try_from(envelope.op) {
            Ok(op) => op,
            Err(_) => return unknown_op(),
        };
        let payload = envelope.payload.as_slice();
        match op {
            proto::TaskOp::Unspecified => unknown_op(),
            proto::TaskOp::State => route(payload, |r| self.state(r)).await,
            proto::TaskOp::Create => route(payload, |r| self.create(r)).await,
            proto::TaskOp::Start => route(payload, |r| self.start(r)).await,
            proto::TaskOp::Delete => route(payload, |r| self.delete(r)).await,
            proto::TaskOp::Pids => route(payload, |r| self.pids(r)).await,
            proto::TaskOp::Pause => route(payload, |r| self.pause(r)).await,
            proto::TaskOp::Resume => route(payload, |r| self.resume(r)).await,
            proto::TaskOp::Checkpoint => route(payload, |r| self.checkpoint(r)).await,
            proto::TaskOp::Kill => route(payload, |r| self.kill(r)).await,
            proto::TaskOp::Exec => route(payload, |r| self.exec_process(r)).await,
            proto::TaskOp::ResizePty => route(payload, |r| self.resize_pty(r)).await,
            proto::TaskOp::CloseIo => route(payload, |r| self.close_io(r)).await,
            proto::TaskOp::Update => route(payload, |r| self.update(r)).await,
            proto::TaskOp::Wait => route(payload, |r| self.wait(r)).await,
            proto::TaskOp::Stats => route(payload, |r| self.stats(r)).await,
            proto::TaskOp::Connect => route(payload, |r| self.connect(r)).await,
            proto::TaskOp::Shutdown => route(payload, |r| self.shutdown(r)).await,
            proto::TaskOp::DiagExecInHost => {
                route(payload, |r| self.diag_exec_in_host(r)).await
            }
            proto::TaskOp::DiagStacks => route(payload, |r| self.diag_stacks(r)).await,
        }
    }

    /// Begin/end activity logging around one handler.
    async fn activity<T, F>(&self, name: &'static str, tid: &str, eid: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        info!(activity = name, tid, eid, "shim activity begin");
        let result = fut.await;
        match &result {
            Ok(_) => info!(activity = name, tid, eid, "shim activity end"),
            Err(e) => error!(activity = name, tid, eid, error = %e, "shim activity end"),
        }
        result
    }

    // Registry resolution

    async fn task(&self, tid: &str) -> Result<Arc<Task>> {
        match &*self.state.read().await {
            Some(TaskOrPod::Task(task)) if task.id() == tid => Ok(task.clone()),
            Some(TaskOrPod::Pod(pod)) => pod.get_task(tid).await,
            _ => Err(ShimError::TaskNotFound {
                tid: tid.to_string(),
            }),
        }
    }

    async fn exec(&self, tid: &str, eid: &str) -> Result<Arc<Exec>> {
        self.task(tid).await?.get_exec(eid).await
    }

    async fn all_tasks(&self) -> Vec<Arc<Task>> {
        match &*self.state.read().await {
            Some(TaskOrPod::Task(task)) => vec![task.clone()],
            Some(TaskOrPod::Pod(pod)) => pod.tasks().await,
            None => Vec::new(),
        }
    }

    // Operations

    pub async fn state(&self, req: proto::StateRequest) -> Result<proto::StateResponse> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("State", &tid, &eid, async {
            let exec = self.exec(&req.id, &req.exec_id).await?;
            let status = exec.status().await;
            debug!(tid = %req.id, eid = %req.exec_id, state = %status.state, exit_status = status.exit_status, "state");
            Ok(state_response(status))
        })
        .await
    }

    pub async fn create(&self, req: proto::CreateTaskRequest) -> Result<proto::CreateTaskResponse> {
        let tid = req.id.clone();
        self.activity("Create", &tid, "", async move { self.create_inner(req).await })
            .await
    }

    async fn create_inner(&self, req: proto::CreateTaskRequest) -> Result<proto::CreateTaskResponse> {
        if req.id.is_empty() {
            return Err(ShimError::InvalidArgument("task id is required".to_string()));
        }

        // Workload containers join an installed pod concurrently, without
        // the create lock.
        if self.is_sandbox && req.id != self.tid {
            let pod = match &*self.state.read().await {
                Some(TaskOrPod::Pod(pod)) => pod.clone(),
                _ => {
                    return Err(ShimError::FailedPrecondition(format!(
                        "pod sandbox '{}' must be created first",
                        self.tid
                    )));
                }
            };
            if req.parent_id != self.tid {
                return Err(ShimError::InvalidArgument(format!(
                    "workload parent '{}' does not match pod '{}'",
                    req.parent_id, self.tid
                )));
            }
            if pod.get_task(&req.id).await.is_ok() {
                return Err(ShimError::AlreadyExists { id: req.id });
            }
            let task = self.new_task(&req).await?;
            if let Err(e) = pod.add_task(task.clone()).await {
                task.force_exit_all(1).await;
                return Err(e);
            }
            let pid = task.init().pid().await;
            return Ok(proto::CreateTaskResponse { pid });
        }

        let _guard = self.create_lock.lock().await;
        if req.id != self.tid {
            return Err(ShimError::InvalidArgument(format!(
                "expected task id '{}', got '{}'",
                self.tid, req.id
            )));
        }
        if self.state.read().await.is_some() {
            return Err(ShimError::AlreadyExists { id: req.id });
        }
        let task = self.new_task(&req).await?;
        let pid = task.init().pid().await;
        let installed = if self.is_sandbox {
            TaskOrPod::Pod(Pod::new(req.id.clone(), task))
        } else {
            TaskOrPod::Task(task)
        };
        *self.state.write().await = Some(installed);
        Ok(proto::CreateTaskResponse { pid })
    }

    async fn new_task(&self, req: &proto::CreateTaskRequest) -> Result<Arc<Task>> {
        let bundle = PathBuf::from(&req.bundle);
        let init_spec = guest::load_bundle_process_spec(&bundle)
            .map_err(|e| ShimError::InvalidArgument(format!("bundle: {e:#}")))?;
        let io = IoRelay::open(&req.stdin, &req.stdout, &req.stderr, req.terminal)
            .await
            .map_err(ShimError::Other)?;
        let created = match self
            .runtime
            .create_container(&ContainerRequest {
                id: req.id.clone(),
                bundle: bundle.clone(),
                init_spec: init_spec.clone(),
            })
            .await
        {
            Ok(created) => created,
            Err(e) => {
                io.close().await;
                return Err(ShimError::Other(e.context("creating container")));
            }
        };
        Ok(Task::new(
            self.events.clone(),
            req.id.clone(),
            created.host,
            created.container,
            created.flavor,
            bundle,
            init_spec,
            io,
        ))
    }

    pub async fn start(&self, req: proto::StartRequest) -> Result<proto::StartResponse> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("Start", &tid, &eid, async {
            let exec = self.exec(&req.id, &req.exec_id).await?;
            let pid = exec.start().await?;
            debug!(tid = %req.id, eid = %req.exec_id, pid, "started");
            Ok(proto::StartResponse { pid })
        })
        .await
    }

    pub async fn delete(&self, req: proto::DeleteRequest) -> Result<proto::DeleteResponse> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("Delete", &tid, &eid, async {
            let task = self.task(&req.id).await?;
            let (pid, exit_status, exited_at) = task.delete_exec(&req.exec_id).await?;
            if req.exec_id.is_empty() || req.exec_id == req.id {
                if let Some(TaskOrPod::Pod(pod)) = &*self.state.read().await {
                    if req.id != pod.id() {
                        pod.remove_task(&req.id).await;
                    }
                }
            }
            debug!(tid = %req.id, eid = %req.exec_id, pid, exit_status, "deleted");
            Ok(proto::DeleteResponse {
                pid,
                exit_status,
                exited_at_ns: exited_at.timestamp_nanos_opt().unwrap_or_default(),
            })
        })
        .await
    }

    pub async fn pids(&self, req: proto::PidsRequest) -> Result<proto::PidsResponse> {
        let tid = req.id.clone();
        self.activity("Pids", &tid, "", async {
            let task = self.task(&req.id).await?;
            let processes = task
                .pids()
                .await
                .into_iter()
                .map(|(pid, exec_id)| proto::ProcessDetails { pid, exec_id })
                .collect();
            Ok(proto::PidsResponse { processes })
        })
        .await
    }

    pub async fn pause(&self, req: proto::PauseRequest) -> Result<proto::Empty> {
        let tid = req.id.clone();
        self.activity("Pause", &tid, "", async {
            Err(ShimError::Unimplemented("Pause"))
        })
        .await
    }

    pub async fn resume(&self, req: proto::ResumeRequest) -> Result<proto::Empty> {
        let tid = req.id.clone();
        self.activity("Resume", &tid, "", async {
            Err(ShimError::Unimplemented("Resume"))
        })
        .await
    }

    pub async fn checkpoint(&self, req: proto::CheckpointRequest) -> Result<proto::Empty> {
        let tid = req.id.clone();
        self.activity("Checkpoint", &tid, "", async {
            Err(ShimError::Unimplemented("Checkpoint"))
        })
        .await
    }

    pub async fn kill(&self, req: proto::KillRequest) -> Result<proto::Empty> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("Kill", &tid, &eid, async {
            debug!(tid = %req.id, eid = %req.exec_id, signal = req.signal, all = req.all, "kill");
            let task = self.task(&req.id).await?;
            task.kill_exec(&req.exec_id, req.signal, req.all).await?;
            Ok(proto::Empty {})
        })
        .await
    }

    pub async fn exec_process(&self, req: proto::ExecProcessRequest) -> Result<proto::Empty> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("Exec", &tid, &eid, async move {
            if req.exec_id.is_empty() {
                return Err(ShimError::InvalidArgument("exec id is required".to_string()));
            }
            let task = self.task(&req.id).await?;
            let spec: ProcessSpec = serde_json::from_slice(&req.spec)
                .map_err(|e| ShimError::InvalidArgument(format!("process spec: {e}")))?;
            let io = IoRelay::open(&req.stdin, &req.stdout, &req.stderr, req.terminal)
                .await
                .map_err(ShimError::Other)?;
            task.create_exec(&req.exec_id, spec, io).await?;
            Ok(proto::Empty {})
        })
        .await
    }

    pub async fn resize_pty(&self, req: proto::ResizePtyRequest) -> Result<proto::Empty> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("ResizePty", &tid, &eid, async {
            debug!(tid = %req.id, eid = %req.exec_id, width = req.width, height = req.height, "resize pty");
            let exec = self.exec(&req.id, &req.exec_id).await?;
            exec.resize_pty(req.width, req.height).await?;
            Ok(proto::Empty {})
        })
        .await
    }

    pub async fn close_io(&self, req: proto::CloseIoRequest) -> Result<proto::Empty> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("CloseIO", &tid, &eid, async {
            let exec = self.exec(&req.id, &req.exec_id).await?;
            exec.close_io(req.stdin).await?;
            Ok(proto::Empty {})
        })
        .await
    }

    pub async fn update(&self, req: proto::UpdateTaskRequest) -> Result<proto::Empty> {
        let tid = req.id.clone();
        self.activity("Update", &tid, "", async {
            Err(ShimError::Unimplemented("Update"))
        })
        .await
    }

    pub async fn wait(&self, req: proto::WaitRequest) -> Result<proto::WaitResponse> {
        let (tid, eid) = (req.id.clone(), req.exec_id.clone());
        self.activity("Wait", &tid, &eid, async {
            let exec = self.exec(&req.id, &req.exec_id).await?;
            let status = exec.wait().await;
            debug!(tid = %req.id, eid = %req.exec_id, exit_status = status.exit_status, "wait finished");
            Ok(proto::WaitResponse {
                exit_status: status.exit_status,
                exited_at_ns: status
                    .exited_at
                    .and_then(|t| t.timestamp_nanos_opt())
                    .unwrap_or_default(),
            })
        })
        .await
    }

    pub async fn stats(&self, req: proto::StatsRequest) -> Result<proto::Empty> {
        let tid = req.id.clone();
        self.activity("Stats", &tid, "", async {
            Err(ShimError::Unimplemented("Stats"))
        })
        .await
    }

    pub async fn connect(&self, req: proto::ConnectRequest) -> Result<proto::ConnectResponse> {
        let tid = req.id.clone();
        self.activity("Connect", &tid, "", async {
            let task = self.task(&req.id).await?;
            Ok(proto::ConnectResponse {
                shim_pid: std::process::id(),
                task_pid: task.init().pid().await,
                version: SHIM_VERSION.to_string(),
            })
        })
        .await
    }

    pub async fn shutdown(&self, req: proto::ShutdownRequest) -> Result<proto::Empty> {
        let tid = req.id.clone();
        self.activity("Shutdown", &tid, "", async {
            debug!(tid = %req.id, now = req.now, "shutdown");
            let tasks = self.all_tasks().await;
            for task in tasks {
                if req.now {
                    task.force_exit_all(1).await;
                } else {
                    task.teardown().await;
                }
            }
            self.stop.signal();
            Ok(proto::Empty {})
        })
        .await
    }

    pub async fn diag_exec_in_host(
        &self,
        req: proto::DiagExecInHostRequest,
    ) -> Result<proto::DiagExecInHostResponse> {
        self.activity("DiagExecInHost", "", "", async move {
            let host = self.runtime.vm_host().ok_or_else(|| {
                ShimError::FailedPrecondition("no utility-vm host to exec in".to_string())
            })?;
            diag::exec_in_host(host, req).await
        })
        .await
    }

    pub async fn diag_stacks(
        &self,
        _req: proto::DiagStacksRequest,
    ) -> Result<proto::DiagStacksResponse> {
        self.activity("DiagStacks", "", "", async {
            let mut dump = String::new();
            for task in self.all_tasks().await {
                for (eid, status) in task_exec_statuses(&task).await {
                    let _ = writeln!(
                        dump,
                        "task {} exec {} state={} pid={} exit_status={}",
                        task.id(),
                        eid,
                        status.state,
                        status.pid,
                        status.exit_status,
                    );
                }
            }
            let backtrace = std::backtrace::Backtrace::force_capture();
            let _ = write!(dump, "\nserving thread:\n{backtrace}");
            Ok(proto::DiagStacksResponse { stacks: dump })
        })
        .await
    }
}

async fn task_exec_statuses(task: &Arc<Task>) -> Vec<(String, ExecStatus)> {
    let mut out = Vec::new();
    for (pid, eid) in task.pids().await {
        let _ = pid;
        if let Ok(exec) = task.get_exec(&eid).await {
            out.push((eid, exec.status().await));
        }
    }
    out
}

fn state_response(status: ExecStatus) -> proto::StateResponse {
    let proto_status = match status.state {
        ExecState::Created => proto::ProcessStatus::Created,
        ExecState::Running => proto::ProcessStatus::Running,
        ExecState::Exited => proto::ProcessStatus::Stopped,
    };
    proto::StateResponse {
        id: status.tid,
        exec_id: status.eid,
        bundle: status.bundle,
        pid: status.pid,
        status: proto_status as i32,
        stdin: status.stdin,
        stdout: status.stdout,
        stderr: status.stderr,
        terminal: status.terminal,
        exit_status: status.exit_status,
        exited_at_ns: status
            .exited_at
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or_default(),
    }
}

async fn route<Req, Resp, F, Fut>(payload: &[u8], handler: F) -> proto::Reply
where
    Req: Message + Default,
    Resp: Message,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Resp>>,
{
    let req = match Req::decode(payload) {
        Ok(req) => req,
        Err(e) => {
            return reply_err(&ShimError::InvalidArgument(format!(
                "malformed request payload: {e}"
            )));
        }
    };
    match handler(req).await {
        Ok(resp) => proto::Reply {
            code: proto::Code::Ok as i32,
            error: String::new(),
            payload: resp.encode_to_vec(),
        },
        Err(e) => reply_err(&e),
    }
}

fn reply_err(err: &ShimError) -> proto::Reply {
    proto::Reply {
        code: err.code() as i32,
        error: err.to_string(),
        payload: Vec::new(),
    }
}
