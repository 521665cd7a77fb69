use serde::Serialize;
use stepwright_core_types::CoreError;

use crate::model::TaskSummary;

/// Lifecycle notifications published on the scheduler's event bus.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskQueued {
        task: TaskSummary,
    },
    TaskStarted {
        task: TaskSummary,
    },
    TaskCompleted {
        task: TaskSummary,
        attempts: u32,
    },
    TaskFailed {
        task: TaskSummary,
        attempts: u32,
        error: CoreError,
    },
    TaskCancelled {
        task: TaskSummary,
    },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::TaskQueued { .. } => "task_queued",
            TaskEvent::TaskStarted { .. } => "task_started",
            TaskEvent::TaskCompleted { .. } => "task_completed",
            TaskEvent::TaskFailed { .. } => "task_failed",
            TaskEvent::TaskCancelled { .. } => "task_cancelled",
        }
    }

    pub fn task(&self) -> &TaskSummary {
        match self {
            TaskEvent::TaskQueued { task }
            | TaskEvent::TaskStarted { task }
            | TaskEvent::TaskCompleted { task, .. }
            | TaskEvent::TaskFailed { task, .. }
            | TaskEvent::TaskCancelled { task } => task,
        }
    }
}
