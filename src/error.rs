//! Domain errors and their transport mapping.

use std::time::Duration;

use thiserror::Error;

use crate::exec::ExecState;
use crate::proto::Code;
use crate::signals::GuestFlavor;

/// Errors raised by the task service and the exec state machine.
///
/// Handlers map these to the transport's canonical codes at the dispatch
/// boundary; everything opaque from the platform travels as `Other`.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task with id '{tid}' not found")]
    TaskNotFound { tid: String },

    #[error("exec '{eid}' in task '{tid}' not found")]
    NotFound { tid: String, eid: String },

    #[error("id '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("exec '{eid}' in task '{tid}' is in state {state}: cannot {op}")]
    InvalidState {
        tid: String,
        eid: String,
        state: ExecState,
        op: &'static str,
    },

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("signal {signal} is not valid for a {flavor} guest with the current signal capability")]
    InvalidSignal { signal: u32, flavor: GuestFlavor },

    #[error("{op} did not complete within {timeout:?}")]
    DeadlineExceeded {
        op: &'static str,
        timeout: Duration,
    },

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShimError {
    /// Canonical transport code for this error.
    pub fn code(&self) -> Code {
        match self {
            ShimError::InvalidArgument(_) => Code::InvalidArgument,
            ShimError::TaskNotFound { .. } | ShimError::NotFound { .. } => Code::NotFound,
            ShimError::AlreadyExists { .. } => Code::AlreadyExists,
            ShimError::InvalidState { .. }
            | ShimError::FailedPrecondition(_)
            | ShimError::InvalidSignal { .. } => Code::FailedPrecondition,
            ShimError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            ShimError::Unimplemented(_) => Code::Unimplemented,
            ShimError::Other(_) => Code::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;
