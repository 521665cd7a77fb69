use stepwright_core_types::{CoreError, ErrorKind, RunId};
use stepwright_scheduler::SchedulerError;
use thiserror::Error;

use crate::adapter::DriverError;
use crate::model::RunStatus;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("run {0} already registered")]
    Duplicate(RunId),
    #[error("run {run_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("run {run_id}: no step {order}")]
    UnknownStep { run_id: RunId, order: usize },
    #[error("run {run_id}: step {order} already finished")]
    StepFinished { run_id: RunId, order: usize },
    #[error("run {run_id}: driver session unavailable: {source}")]
    Session {
        run_id: RunId,
        #[source]
        source: DriverError,
    },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Scheduler(err) => err.kind(),
            RunError::Session { source, .. } if source.is_transient() => ErrorKind::TransientStep,
            RunError::Session { .. } => ErrorKind::FatalStep,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<RunError> for CoreError {
    fn from(value: RunError) -> Self {
        match value {
            RunError::Scheduler(err) => err.into(),
            other => CoreError::new(other.kind(), other.to_string()),
        }
    }
}
