//! Shared test fixtures: a scriptable fake guest runtime and bundle helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use uvshim::events::TaskEvent;
use uvshim::guest::{
    Container, ContainerRequest, CreatedContainer, GuestProcess, GuestStdio, ProcessRequest,
    ProcessSpec, Runtime,
};
use uvshim::latch::Latch;
use uvshim::signals::{GuestFlavor, SignalRequest};

/// Control handle for one fake guest process.
pub struct FakeProcessState {
    pub pid: u32,
    exited: Latch,
    exit_code: Mutex<Option<i32>>,
    kill_code: i32,
    signals: Mutex<Vec<SignalRequest>>,
    resizes: Mutex<Vec<(u16, u16)>>,
}

impl FakeProcessState {
    pub fn new(pid: u32) -> Arc<Self> {
        Self::with_kill_code(pid, 137)
    }

    pub fn with_kill_code(pid: u32, kill_code: i32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            exited: Latch::new(),
            exit_code: Mutex::new(None),
            kill_code,
            signals: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
        })
    }

    /// Terminate the fake process with `code`. The first recorded code wins.
    pub async fn finish(&self, code: i32) {
        let mut slot = self.exit_code.lock().await;
        if slot.is_none() {
            *slot = Some(code);
        }
        drop(slot);
        self.exited.signal();
    }

    pub fn is_exited(&self) -> bool {
        self.exited.is_signaled()
    }

    pub async fn sent_signals(&self) -> Vec<SignalRequest> {
        self.signals.lock().await.clone()
    }

    pub async fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().await.clone()
    }
}

pub struct FakeProcess(pub Arc<FakeProcessState>);

#[async_trait]
impl GuestProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.0.pid
    }

    fn take_stdio(&mut self) -> GuestStdio {
        GuestStdio::default()
    }

    async fn signal(&self, request: SignalRequest) -> anyhow::Result<bool> {
        if self.0.exited.is_signaled() {
            return Ok(false);
        }
        self.0.signals.lock().await.push(request.clone());
        if matches!(request, SignalRequest::Posix { signal: 9 }) {
            self.0.finish(self.0.kill_code).await;
        }
        Ok(true)
    }

    async fn kill(&self) -> anyhow::Result<bool> {
        if self.0.exited.is_signaled() {
            return Ok(false);
        }
        self.0.finish(self.0.kill_code).await;
        Ok(true)
    }

    async fn resize_console(&self, width: u16, height: u16) -> anyhow::Result<()> {
        self.0.resizes.lock().await.push((width, height));
        Ok(())
    }

    async fn wait(&self) {
        self.0.exited.wait().await;
    }

    async fn exit_code(&self) -> anyhow::Result<i32> {
        (*self.0.exit_code.lock().await).ok_or_else(|| anyhow::anyhow!("process has not exited"))
    }
}

/// A scriptable container: processes are planned ahead and handed out in
/// order.
pub struct FakeContainer {
    id: String,
    flavor: GuestFlavor,
    fail_start: bool,
    fail_create: bool,
    started: AtomicBool,
    terminated: AtomicBool,
    closed: AtomicBool,
    exited: Latch,
    planned: Mutex<VecDeque<Arc<FakeProcessState>>>,
}

impl FakeContainer {
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, GuestFlavor::Linux, false, false)
    }

    pub fn with_flavor(id: &str, flavor: GuestFlavor) -> Arc<Self> {
        Self::build(id, flavor, false, false)
    }

    pub fn failing_start(id: &str) -> Arc<Self> {
        Self::build(id, GuestFlavor::Linux, true, false)
    }

    pub fn failing_create(id: &str) -> Arc<Self> {
        Self::build(id, GuestFlavor::Linux, false, true)
    }

    fn build(id: &str, flavor: GuestFlavor, fail_start: bool, fail_create: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            flavor,
            fail_start,
            fail_create,
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exited: Latch::new(),
            planned: Mutex::new(VecDeque::new()),
        })
    }

    pub async fn plan_process(&self, state: Arc<FakeProcessState>) {
        self.planned.lock().await.push_back(state);
    }

    /// Simulate the container terminating out from under its execs.
    pub fn exit(&self) {
        self.exited.signal();
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn guest_flavor(&self) -> GuestFlavor {
        self.flavor
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("container refused to start");
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_process(&self, _req: ProcessRequest) -> anyhow::Result<Box<dyn GuestProcess>> {
        if self.fail_create {
            anyhow::bail!("process launch failed");
        }
        let state = self
            .planned
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no planned process in fake container"))?;
        Ok(Box::new(FakeProcess(state)))
    }

    async fn wait(&self) {
        self.exited.wait().await;
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        self.exited.signal();
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Runtime that hands out fake containers, each pre-planned with one
/// process.
pub struct FakeRuntime {
    flavor: GuestFlavor,
    next_pid: AtomicU32,
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    processes: Mutex<HashMap<String, Arc<FakeProcessState>>>,
    host: Arc<FakeContainer>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flavor: GuestFlavor::Linux,
            next_pid: AtomicU32::new(42),
            containers: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            host: FakeContainer::new("host"),
        })
    }

    pub async fn container(&self, id: &str) -> Arc<FakeContainer> {
        self.containers
            .lock()
            .await
            .get(id)
            .cloned()
            .expect("container was never created")
    }

    /// The process planned for a container's init exec.
    pub async fn init_process(&self, id: &str) -> Arc<FakeProcessState> {
        self.processes
            .lock()
            .await
            .get(id)
            .cloned()
            .expect("container was never created")
    }

    pub fn host_container(&self) -> Arc<FakeContainer> {
        self.host.clone()
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create_container(&self, req: &ContainerRequest) -> anyhow::Result<CreatedContainer> {
        let container = FakeContainer::with_flavor(&req.id, self.flavor);
        let state = FakeProcessState::new(self.next_pid.fetch_add(1, Ordering::SeqCst));
        container.plan_process(state.clone()).await;
        self.containers
            .lock()
            .await
            .insert(req.id.clone(), container.clone());
        self.processes.lock().await.insert(req.id.clone(), state);
        Ok(CreatedContainer {
            host: None,
            container,
            flavor: self.flavor,
        })
    }

    fn vm_host(&self) -> Option<Arc<dyn Container>> {
        Some(self.host.clone())
    }
}

/// Write a minimal OCI bundle config with the given init command.
pub fn write_bundle(dir: &Path, args: &[&str]) {
    let spec = serde_json::json!({
        "process": {
            "args": args,
            "cwd": "/",
            "env": ["PATH=/usr/local/bin:/usr/bin:/bin"],
        }
    });
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_vec_pretty(&spec).expect("serializing bundle config"),
    )
    .expect("writing bundle config");
}

pub fn process_spec(args: &[&str]) -> ProcessSpec {
    ProcessSpec {
        args: args.iter().map(|s| s.to_string()).collect(),
        ..ProcessSpec::default()
    }
}

/// Receive the next published event, bounded so a missing event fails the
/// test instead of hanging it.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> TaskEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}
