use std::sync::Arc;

use async_trait::async_trait;
use stepwright_core_types::TaskId;
use stepwright_event_bus::{subscribe_fn, InMemoryBus, Subscription};
use tokio::sync::oneshot;

use crate::error::SchedulerError;
use crate::events::TaskEvent;
use crate::executor::TaskExecutor;
use crate::metrics::SchedulerMetricsSnapshot;
use crate::model::{QueueStatus, SchedulerConfig, Task, TaskOutput, TaskState};
use crate::orchestrator::Orchestrator;
use crate::runtime::SchedulerRuntime;

/// Resolves once the task reaches a terminal state.
pub struct TaskHandle {
    task_id: TaskId,
    receiver: oneshot::Receiver<Result<TaskOutput, SchedulerError>>,
}

impl TaskHandle {
    pub(crate) fn new(
        task_id: TaskId,
        receiver: oneshot::Receiver<Result<TaskOutput, SchedulerError>>,
    ) -> Self {
        Self { task_id, receiver }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub async fn wait(self) -> Result<TaskOutput, SchedulerError> {
        self.receiver.await.unwrap_or(Err(SchedulerError::ShutDown))
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn enqueue(
        &self,
        task: Task,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<TaskHandle, SchedulerError>;
    async fn cancel(&self, task_id: &TaskId) -> bool;
    fn status(&self, task_id: &TaskId) -> TaskState;
    fn queue_status(&self) -> QueueStatus;
}

/// Scheduler wired to an in-memory lifecycle event bus.
pub struct SchedulerService {
    orchestrator: Orchestrator,
}

impl SchedulerService {
    pub fn new(config: SchedulerConfig) -> Self {
        let bus = InMemoryBus::new(config.event_buffer);
        let runtime = SchedulerRuntime::new(config);
        Self {
            orchestrator: Orchestrator::new(runtime, bus),
        }
    }

    pub async fn start(&self) {
        self.orchestrator.spawn().await;
    }

    /// Invoke `callback` for every lifecycle event published from now on.
    pub fn on_task_event<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(TaskEvent) + Send + 'static,
    {
        subscribe_fn(self.orchestrator.bus().as_ref(), callback)
    }

    pub fn events(&self) -> Arc<InMemoryBus<TaskEvent>> {
        Arc::clone(self.orchestrator.bus())
    }

    pub fn config(&self) -> SchedulerConfig {
        self.orchestrator.runtime().config()
    }

    pub fn update_config(&self, config: SchedulerConfig) {
        self.orchestrator.runtime().update_config(config);
    }

    pub fn metrics(&self) -> SchedulerMetricsSnapshot {
        self.orchestrator.runtime().metrics().snapshot()
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

impl Default for SchedulerService {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

#[async_trait]
impl Scheduler for SchedulerService {
    async fn enqueue(
        &self,
        task: Task,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<TaskHandle, SchedulerError> {
        self.orchestrator.enqueue(task, executor).await
    }

    async fn cancel(&self, task_id: &TaskId) -> bool {
        self.orchestrator.cancel(task_id).await
    }

    fn status(&self, task_id: &TaskId) -> TaskState {
        self.orchestrator.runtime().status(task_id)
    }

    fn queue_status(&self) -> QueueStatus {
        self.orchestrator.runtime().queue_status()
    }
}

#[async_trait]
impl<S> Scheduler for Arc<S>
where
    S: Scheduler + ?Sized,
{
    async fn enqueue(
        &self,
        task: Task,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<TaskHandle, SchedulerError> {
        (**self).enqueue(task, executor).await
    }

    async fn cancel(&self, task_id: &TaskId) -> bool {
        (**self).cancel(task_id).await
    }

    fn status(&self, task_id: &TaskId) -> TaskState {
        (**self).status(task_id)
    }

    fn queue_status(&self) -> QueueStatus {
        (**self).queue_status()
    }
}
