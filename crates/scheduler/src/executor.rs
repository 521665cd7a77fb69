use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use stepwright_core_types::CoreError;

use crate::model::{Task, TaskContext, TaskOutput};

/// Work invoked by the scheduler under its concurrency limits.
///
/// Implementations must poll `ctx.cancel` at their own checkpoints.
/// Cancellation never aborts a running attempt; only the per-attempt
/// timeout drops the future.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: TaskContext) -> Result<TaskOutput, CoreError>;
}

#[derive(Clone, Copy, Default, Debug)]
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(&self, _task: &Task, ctx: TaskContext) -> Result<TaskOutput, CoreError> {
        Ok(TaskOutput {
            attempts: ctx.attempt,
            value: None,
        })
    }
}

type ExecFn =
    dyn Fn(Task, TaskContext) -> BoxFuture<'static, Result<TaskOutput, CoreError>> + Send + Sync;

/// Adapts a closure into a [`TaskExecutor`].
pub struct FnExecutor {
    inner: Box<ExecFn>,
}

impl FnExecutor {
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: Fn(Task, TaskContext) -> BoxFuture<'static, Result<TaskOutput, CoreError>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self { inner: Box::new(f) })
    }
}

#[async_trait]
impl TaskExecutor for FnExecutor {
    async fn execute(&self, task: &Task, ctx: TaskContext) -> Result<TaskOutput, CoreError> {
        (self.inner)(task.clone(), ctx).await
    }
}

#[async_trait]
impl<E> TaskExecutor for Arc<E>
where
    E: TaskExecutor + ?Sized,
{
    async fn execute(&self, task: &Task, ctx: TaskContext) -> Result<TaskOutput, CoreError> {
        (**self).execute(task, ctx).await
    }
}
