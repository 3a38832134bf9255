//! Pod sandbox: a sandbox task hosting workload tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, ShimError};
use crate::task::Task;

/// The sandbox task plus the workload tasks sharing its VM. Workload
/// creation is concurrent; only the sandbox itself went through the
/// create-lock.
pub struct Pod {
    id: String,
    sandbox: Arc<Task>,
    workloads: RwLock<HashMap<String, Arc<Task>>>,
}

impl Pod {
    pub fn new(id: String, sandbox: Arc<Task>) -> Arc<Self> {
        Arc::new(Self {
            id,
            sandbox,
            workloads: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sandbox(&self) -> &Arc<Task> {
        &self.sandbox
    }

    pub async fn get_task(&self, tid: &str) -> Result<Arc<Task>> {
        if tid == self.id {
            return Ok(self.sandbox.clone());
        }
        self.workloads
            .read()
            .await
            .get(tid)
            .cloned()
            .ok_or_else(|| ShimError::TaskNotFound {
                tid: tid.to_string(),
            })
    }

    pub async fn add_task(&self, task: Arc<Task>) -> Result<()> {
        debug!(pod = %self.id, tid = %task.id(), "adding workload task");
        let mut workloads = self.workloads.write().await;
        if task.id() == self.id || workloads.contains_key(task.id()) {
            return Err(ShimError::AlreadyExists {
                id: task.id().to_string(),
            });
        }
        workloads.insert(task.id().to_string(), task);
        Ok(())
    }

    pub async fn remove_task(&self, tid: &str) {
        self.workloads.write().await.remove(tid);
    }

    /// Every task in the pod, workloads ahead of the sandbox so teardown
    /// stops them before the VM that hosts them.
    pub async fn tasks(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> =
            self.workloads.read().await.values().cloned().collect();
        tasks.push(self.sandbox.clone());
        tasks
    }
}
