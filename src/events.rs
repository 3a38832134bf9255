//! Lifecycle events published toward the supervising manager.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

pub const TOPIC_TASK_START: &str = "/tasks/start";
pub const TOPIC_TASK_EXEC_STARTED: &str = "/tasks/exec-started";
pub const TOPIC_TASK_EXIT: &str = "/tasks/exit";

/// Events emitted by execs and task teardown.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// The init exec entered Running.
    Started { tid: String, pid: u32 },
    /// An additional exec entered Running.
    ExecStarted { tid: String, eid: String, pid: u32 },
    /// An exec entered Exited. The init exec's exit is published by task
    /// teardown, not by the exec itself.
    Exited {
        tid: String,
        eid: String,
        pid: u32,
        exit_status: u32,
        exited_at: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            TaskEvent::Started { .. } => TOPIC_TASK_START,
            TaskEvent::ExecStarted { .. } => TOPIC_TASK_EXEC_STARTED,
            TaskEvent::Exited { .. } => TOPIC_TASK_EXIT,
        }
    }
}

/// Publisher handed to every exec at construction.
///
/// Send is synchronous, so events leave in the order the transitions that
/// produced them were serialized.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl EventPublisher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: TaskEvent) {
        if self.tx.send(event).is_err() {
            debug!("event receiver dropped; event discarded");
        }
    }
}
