//! Contract between the shim core and the guest runtime.
//!
//! The platform that actually hosts containers (a hypervisor host-compute
//! service and its guest agents) sits behind these traits. The shim core
//! only ever starts containers, launches processes, waits on them and
//! delivers signals; everything else is the runtime's business.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::signals::{GuestFlavor, SignalRequest};

/// Lowest host OS build carrying structured signal delivery to guests.
pub const SIGNAL_SUPPORT_MIN_BUILD: u32 = 17763;

/// Build of the host OS the shim runs on. The real probe belongs to the
/// platform runtime; the portable core assumes a current build.
pub fn host_os_build() -> u32 {
    26100
}

/// Combined signal capability: the host build is new enough and the guest
/// agent, when a utility VM is present, advertises support.
pub fn signals_supported(host: Option<&UtilityVm>) -> bool {
    host_os_build() >= SIGNAL_SUPPORT_MIN_BUILD
        && host.is_none_or(UtilityVm::signal_process_supported)
}

/// Handle to the utility VM hosting a container. Absent for process-isolated
/// execs. Shared read-only across all execs of a task; teardown is a
/// task-level responsibility, execs never close it.
#[derive(Debug, Clone)]
pub struct UtilityVm {
    id: String,
    os: GuestFlavor,
    guest_signals: bool,
}

impl UtilityVm {
    pub fn new(id: impl Into<String>, os: GuestFlavor, guest_signals: bool) -> Self {
        Self {
            id: id.into(),
            os,
            guest_signals,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn os(&self) -> GuestFlavor {
        self.os
    }

    /// True when the guest agent advertises structured signal delivery.
    pub fn signal_process_supported(&self) -> bool {
        self.guest_signals
    }
}

/// OCI process document, captured at exec create time and consulted at start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
}

/// The slice of the bundle's config.json the shim consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleSpec {
    pub process: Option<ProcessSpec>,
}

/// Read the init process document from an on-disk bundle.
pub fn load_bundle_process_spec(bundle: &Path) -> anyhow::Result<ProcessSpec> {
    let path = bundle.join("config.json");
    let raw =
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let spec: BundleSpec = serde_json::from_slice(&raw).context("parsing bundle config")?;
    spec.process
        .ok_or_else(|| anyhow::anyhow!("bundle config carries no process document"))
}

/// Byte streams of a launched guest process, handed to the I/O relay.
#[derive(Default)]
pub struct GuestStdio {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Sync + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Sync + Unpin>>,
}

/// Request to launch one process inside a container.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Process document. `None` when the container config already carries it
    /// (Linux-guest init).
    pub spec: Option<ProcessSpec>,
    pub terminal: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// A container as the shim sees it.
#[async_trait]
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    fn guest_flavor(&self) -> GuestFlavor;

    /// Start the container itself. Called once, by the init exec.
    async fn start(&self) -> anyhow::Result<()>;

    /// Launch a process inside the container.
    async fn create_process(&self, req: ProcessRequest) -> anyhow::Result<Box<dyn GuestProcess>>;

    /// Resolve when the container has terminated.
    async fn wait(&self);

    /// Forcibly stop the container.
    async fn terminate(&self) -> anyhow::Result<()>;

    /// Release the container handle.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A live process inside a container.
#[async_trait]
pub trait GuestProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Take the process stdio streams. Valid once, before the handle is
    /// shared.
    fn take_stdio(&mut self) -> GuestStdio;

    /// Deliver a structured signal. `Ok(false)` means the process was gone.
    async fn signal(&self, request: SignalRequest) -> anyhow::Result<bool>;

    /// Hard-terminate. `Ok(false)` means the process was gone.
    async fn kill(&self) -> anyhow::Result<bool>;

    async fn resize_console(&self, width: u16, height: u16) -> anyhow::Result<()>;

    /// Resolve when the process has terminated.
    async fn wait(&self);

    /// Exit code of the process; valid after `wait`.
    async fn exit_code(&self) -> anyhow::Result<i32>;
}

/// What the runtime hands back for a created container.
pub struct CreatedContainer {
    pub host: Option<Arc<UtilityVm>>,
    pub container: Arc<dyn Container>,
    pub flavor: GuestFlavor,
}

/// Inputs for creating a container.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub id: String,
    pub bundle: PathBuf,
    pub init_spec: ProcessSpec,
}

/// The seam between the dispatcher and the platform.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create_container(&self, req: &ContainerRequest) -> anyhow::Result<CreatedContainer>;

    /// Command target for the utility-VM host, when one exists. Diagnostics
    /// run one-shot processes against it.
    fn vm_host(&self) -> Option<Arc<dyn Container>>;
}
