//! A task: one container, its init exec and any additional execs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, ShimError};
use crate::events::{EventPublisher, TaskEvent};
use crate::exec::{Exec, ExecState};
use crate::guest::{Container, ProcessSpec, UtilityVm};
use crate::latch::Latch;
use crate::relay::IoRelay;
use crate::signals::GuestFlavor;

/// How long teardown waits for the init exec to stop after a kill-intent
/// signal before giving up on it.
pub const PROCESS_STOP_GRACE: Duration = Duration::from_secs(5);

/// One container and the execs running inside it. The container and host
/// handles are shared read-only with every exec; releasing them is this
/// level's responsibility, never an exec's.
pub struct Task {
    events: EventPublisher,
    id: String,
    bundle: PathBuf,
    flavor: GuestFlavor,
    host: Option<Arc<UtilityVm>>,
    container: Arc<dyn Container>,
    init: Arc<Exec>,
    execs: RwLock<HashMap<String, Arc<Exec>>>,
    init_exit_published: Latch,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: EventPublisher,
        id: String,
        host: Option<Arc<UtilityVm>>,
        container: Arc<dyn Container>,
        flavor: GuestFlavor,
        bundle: PathBuf,
        init_spec: ProcessSpec,
        io: IoRelay,
    ) -> Arc<Self> {
        let init = Exec::new(
            events.clone(),
            id.clone(),
            host.clone(),
            container.clone(),
            id.clone(),
            bundle.clone(),
            flavor,
            init_spec,
            io,
        );
        Arc::new(Self {
            events,
            id,
            bundle,
            flavor,
            host,
            container,
            init,
            execs: RwLock::new(HashMap::new()),
            init_exit_published: Latch::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn init(&self) -> &Arc<Exec> {
        &self.init
    }

    pub fn host(&self) -> Option<&Arc<UtilityVm>> {
        self.host.as_ref()
    }

    /// Resolve an exec id. An empty id and the task id both name the init
    /// exec.
    pub async fn get_exec(&self, eid: &str) -> Result<Arc<Exec>> {
        if eid.is_empty() || eid == self.id {
            return Ok(self.init.clone());
        }
        self.execs
            .read()
            .await
            .get(eid)
            .cloned()
            .ok_or_else(|| ShimError::NotFound {
                tid: self.id.clone(),
                eid: eid.to_string(),
            })
    }

    /// Add an additional exec. The relay becomes the new exec's; on any
    /// failure it is closed here.
    pub async fn create_exec(&self, eid: &str, spec: ProcessSpec, io: IoRelay) -> Result<()> {
        debug!(tid = %self.id, eid = %eid, "create exec");
        if let Err(e) = self.validate_new_exec(eid, &spec).await {
            io.close().await;
            return Err(e);
        }
        let mut execs = self.execs.write().await;
        if execs.contains_key(eid) {
            io.close().await;
            return Err(ShimError::AlreadyExists { id: eid.to_string() });
        }
        let exec = Exec::new(
            self.events.clone(),
            self.id.clone(),
            self.host.clone(),
            self.container.clone(),
            eid.to_string(),
            self.bundle.clone(),
            self.flavor,
            spec,
            io,
        );
        execs.insert(eid.to_string(), exec);
        Ok(())
    }

    async fn validate_new_exec(&self, eid: &str, spec: &ProcessSpec) -> Result<()> {
        if eid.is_empty() || eid == self.id {
            return Err(ShimError::InvalidArgument(format!(
                "exec id '{eid}' cannot name the init exec"
            )));
        }
        if spec.args.is_empty() {
            return Err(ShimError::InvalidArgument("missing command".to_string()));
        }
        if self.init.state().await != ExecState::Running {
            return Err(ShimError::FailedPrecondition(format!(
                "task '{}' must be running to add an exec",
                self.id
            )));
        }
        Ok(())
    }

    pub async fn pids(&self) -> Vec<(u32, String)> {
        let mut out = vec![(self.init.pid().await, self.id.clone())];
        for (eid, exec) in self.execs.read().await.iter() {
            out.push((exec.pid().await, eid.clone()));
        }
        out
    }

    /// Deliver a signal to one exec, or to every exec when `all` is set.
    pub async fn kill_exec(&self, eid: &str, signal: u32, all: bool) -> Result<()> {
        if all && !(eid.is_empty() || eid == self.id) {
            return Err(ShimError::InvalidArgument(format!(
                "cannot signal all processes of exec '{eid}'"
            )));
        }
        if all {
            let execs: Vec<Arc<Exec>> = self.execs.read().await.values().cloned().collect();
            for exec in execs {
                match exec.kill(signal).await {
                    // Already-exited execs are not an error for a task-wide kill.
                    Ok(()) | Err(ShimError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.get_exec(eid).await?.kill(signal).await
    }

    /// Remove an exec that has exited. For the init exec this is task
    /// teardown: the deferred exit event is published here, exactly once.
    pub async fn delete_exec(&self, eid: &str) -> Result<(u32, u32, DateTime<Utc>)> {
        debug!(tid = %self.id, eid = %eid, "delete exec");
        let exec = self.get_exec(eid).await?;
        let status = exec.status().await;
        if status.state != ExecState::Exited {
            return Err(ShimError::InvalidState {
                tid: self.id.clone(),
                eid: eid.to_string(),
                state: status.state,
                op: "delete",
            });
        }
        if exec.is_init() {
            self.publish_init_exit().await;
        } else {
            self.execs.write().await.remove(eid);
        }
        Ok((
            status.pid,
            status.exit_status,
            status.exited_at.unwrap_or_else(Utc::now),
        ))
    }

    /// Force every exec toward Exited.
    pub async fn force_exit_all(&self, status: u32) {
        let execs: Vec<Arc<Exec>> = self.execs.read().await.values().cloned().collect();
        for exec in execs {
            exec.force_exit(status).await;
        }
        self.init.force_exit(status).await;
    }

    /// Shutdown-time teardown: force every exec out, wait for the init exec
    /// within the stop grace, then publish its deferred exit event.
    pub async fn teardown(&self) {
        debug!(tid = %self.id, "task teardown");
        self.force_exit_all(1).await;
        if timeout(PROCESS_STOP_GRACE, self.init.wait()).await.is_err() {
            warn!(
                tid = %self.id,
                grace_secs = PROCESS_STOP_GRACE.as_secs(),
                "init exec did not stop within the grace window"
            );
            return;
        }
        self.publish_init_exit().await;
    }

    /// Publish the init exec's exit event. The exec itself never publishes
    /// it; the event only fires once, and only if the init exec ever ran.
    async fn publish_init_exit(&self) {
        let status = self.init.status().await;
        if status.pid == 0 {
            // Never started: no start event was published, so no exit event
            // may be either.
            return;
        }
        if !self.init_exit_published.try_signal() {
            return;
        }
        self.events.publish(TaskEvent::Exited {
            tid: self.id.clone(),
            eid: self.id.clone(),
            pid: status.pid,
            exit_status: status.exit_status,
            exited_at: status.exited_at.unwrap_or_else(Utc::now),
        });
    }
}
