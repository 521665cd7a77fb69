use std::time::Duration;

use stepwright_core_types::{CoreError, ErrorKind, TaskId};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum SchedulerError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Executor(CoreError),
    #[error("task {0} already scheduled")]
    DuplicateTask(TaskId),
    #[error("scheduler shut down")]
    ShutDown,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Cancelled => ErrorKind::Cancelled,
            SchedulerError::Timeout(_) => ErrorKind::TaskTimeout,
            SchedulerError::Executor(err) => err.kind(),
            SchedulerError::DuplicateTask(_) | SchedulerError::ShutDown => ErrorKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Executor errors tagged as cancelled are folded into `Cancelled`.
    pub(crate) fn from_executor(err: CoreError) -> Self {
        if err.is_cancelled() {
            SchedulerError::Cancelled
        } else {
            SchedulerError::Executor(err)
        }
    }
}

impl From<SchedulerError> for CoreError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::Executor(err) => err,
            other => CoreError::new(other.kind(), other.to_string()),
        }
    }
}
