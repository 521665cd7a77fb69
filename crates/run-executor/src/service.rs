use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stepwright_core_types::{RunContext, RunId, TaskId, TenantId};
use stepwright_scheduler::{
    Priority, Scheduler, SchedulerError, Task, TaskExecutor, TaskKind, TaskOutput,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::errors::RunError;
use crate::executor::RunExecutor;
use crate::model::{RunLogEntry, RunLogLevel, RunStatus, TestRun};
use crate::registry::RunRegistry;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRequest {
    pub tenant_id: TenantId,
    pub test_case_id: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl RunRequest {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        test_case_id: impl Into<String>,
        steps: Vec<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            test_case_id: test_case_id.into(),
            steps,
            priority: Priority::default(),
            kind: TaskKind::default(),
            continue_on_failure: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }
}

/// Resolves with the run's final record.
pub struct RunHandle {
    run_id: RunId,
    task_id: TaskId,
    done: oneshot::Receiver<Option<TestRun>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub async fn wait(self) -> Result<TestRun, RunError> {
        match self.done.await {
            Ok(Some(run)) => Ok(run),
            _ => Err(RunError::NotFound(self.run_id)),
        }
    }
}

/// Submits test runs as scheduler tasks and closes out runs the executor
/// never got to finish.
pub struct TestRunService<S> {
    scheduler: Arc<S>,
    executor: Arc<RunExecutor>,
    tasks: Arc<DashMap<RunId, TaskId>>,
}

impl<S> TestRunService<S>
where
    S: Scheduler + 'static,
{
    pub fn new(scheduler: Arc<S>, executor: Arc<RunExecutor>) -> Self {
        Self {
            scheduler,
            executor,
            tasks: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        self.executor.registry()
    }

    pub async fn submit(&self, request: RunRequest) -> Result<RunHandle, RunError> {
        let ctx = RunContext {
            continue_on_failure: request.continue_on_failure,
            ..RunContext::new(request.test_case_id, request.steps)
        };
        let run_id = ctx.run_id.clone();
        let registry = Arc::clone(self.executor.registry());
        registry.register(&ctx)?;

        let task = Task::new(request.tenant_id, request.priority, ctx).with_kind(request.kind);
        let task_id = task.id().clone();
        registry.push_log(
            &run_id,
            RunLogLevel::Info,
            None,
            format!("submitted as task {task_id}"),
        );
        self.tasks.insert(run_id.clone(), task_id.clone());
        let executor: Arc<dyn TaskExecutor> = self.executor.clone();
        let handle = match self.scheduler.enqueue(task, executor).await {
            Ok(handle) => handle,
            Err(err) => {
                self.tasks.remove(&run_id);
                close_out(&registry, &run_id, Err(err.clone()));
                return Err(err.into());
            }
        };
        info!(target: "run_executor", run = %run_id, task = %task_id, "run submitted");

        let (tx, rx) = oneshot::channel();
        let tasks = Arc::clone(&self.tasks);
        let watched = run_id.clone();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            close_out(&registry, &watched, outcome);
            tasks.remove(&watched);
            let _ = tx.send(registry.get(&watched));
        });

        Ok(RunHandle {
            run_id,
            task_id,
            done: rx,
        })
    }

    /// Cancel a queued or running run. False when it is unknown or done.
    pub async fn cancel(&self, run_id: &RunId) -> bool {
        let Some(task_id) = self.tasks.get(run_id).map(|entry| entry.value().clone()) else {
            return false;
        };
        self.scheduler.cancel(&task_id).await
    }

    pub fn run(&self, run_id: &RunId) -> Option<TestRun> {
        self.registry().get(run_id)
    }

    pub fn runs(&self) -> Vec<TestRun> {
        self.registry().list()
    }

    pub fn logs_since(
        &self,
        run_id: &RunId,
        after: Option<u64>,
        limit: Option<usize>,
    ) -> Option<Vec<RunLogEntry>> {
        self.registry().logs_since(run_id, after, None, limit)
    }
}

/// Terminal bookkeeping for runs the executor left open: cancelled while
/// queued, timed out mid-step, or never given a driver session.
fn close_out(
    registry: &RunRegistry,
    run_id: &RunId,
    outcome: Result<TaskOutput, SchedulerError>,
) {
    let Some(status) = registry.status(run_id) else {
        return;
    };
    if status.is_terminal() {
        return;
    }
    let result = match outcome {
        Ok(_) => return,
        Err(err) if err.is_cancelled() => registry
            .skip_pending(run_id)
            .and_then(|_| registry.transition(run_id, RunStatus::Cancelled, None)),
        Err(err) => {
            let reason = err.to_string();
            registry.push_log(run_id, RunLogLevel::Error, None, format!("run failed: {reason}"));
            registry
                .skip_pending(run_id)
                .and_then(|_| registry.transition(run_id, RunStatus::Failed, Some(reason)))
        }
    };
    if let Err(err) = result {
        warn!(target: "run_executor", run = %run_id, error = %err, "could not close out run");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use stepwright_core_types::{Command, PageFingerprint, PageState};
    use stepwright_scheduler::{SchedulerConfig, SchedulerService};

    use super::*;
    use crate::adapter::{
        BrowserDriver, DriverError, DriverFactory, DriverOutcome, SharedDriver,
    };
    use crate::executor::testing::{cache, ScriptedDriver, VerbResolver};
    use crate::model::StepOutcome;

    async fn service(
        config: SchedulerConfig,
        driver: Arc<ScriptedDriver>,
    ) -> TestRunService<SchedulerService> {
        let resolver = Arc::new(VerbResolver::default());
        let executor = RunExecutor::new(
            cache(resolver).await,
            Arc::new(SharedDriver(driver)),
            Arc::new(RunRegistry::new()),
        );
        let scheduler = Arc::new(SchedulerService::new(config));
        scheduler.start().await;
        TestRunService::new(scheduler, Arc::new(executor))
    }

    fn steps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn submitted_run_completes_through_scheduler() {
        let driver = ScriptedDriver::new("fp");
        let svc = service(SchedulerConfig::default(), Arc::clone(&driver)).await;

        let handle = svc
            .submit(RunRequest::new("acme", "login", steps(&["open app", "click login"])))
            .await
            .unwrap();
        let run_id = handle.run_id().clone();
        let run = handle.wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(driver.executed(), vec!["open", "click"]);
        assert_eq!(svc.run(&run_id).unwrap().status, RunStatus::Completed);
        let logs = svc.logs_since(&run_id, None, None).unwrap();
        assert!(logs[0].message.starts_with("submitted as task"));
        assert!(!svc.cancel(&run_id).await);
    }

    #[tokio::test]
    async fn failed_run_is_not_retried_by_scheduler() {
        let driver = ScriptedDriver::new("fp");
        driver.fail("click", DriverError::other("broken"));
        let config = SchedulerConfig {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            ..SchedulerConfig::default()
        };
        let svc = service(config, Arc::clone(&driver)).await;

        let run = svc
            .submit(RunRequest::new("acme", "broken", steps(&["click it"])))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(driver.executed().len(), 1);
    }

    #[tokio::test]
    async fn cancelling_a_queued_run_skips_every_step() {
        let driver = ScriptedDriver::new("fp");
        let release = driver.hold("wait");
        let config = SchedulerConfig {
            global_limit: 1,
            ..SchedulerConfig::default()
        };
        let svc = service(config, Arc::clone(&driver)).await;

        let first = svc
            .submit(RunRequest::new("acme", "slow", steps(&["wait for spinner"])))
            .await
            .unwrap();
        let second = svc
            .submit(RunRequest::new("acme", "queued", steps(&["open app", "click go"])))
            .await
            .unwrap();
        let second_id = second.run_id().clone();

        assert!(svc.cancel(&second_id).await);
        release.notify_one();
        assert_eq!(first.wait().await.unwrap().status, RunStatus::Completed);
        let run = second.wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error.is_none());
        assert!(run.started_at.is_none());
        assert!(run.steps.iter().all(|s| s.outcome == StepOutcome::Skipped));
        assert_eq!(driver.executed(), vec!["wait"]);
    }

    #[tokio::test]
    async fn cancelling_a_running_run_stops_between_steps() {
        let driver = ScriptedDriver::new("fp");
        let release = driver.hold("wait");
        let svc = service(SchedulerConfig::default(), Arc::clone(&driver)).await;

        let handle = svc
            .submit(RunRequest::new(
                "acme",
                "long",
                steps(&["open app", "wait for spinner", "click done"]),
            ))
            .await
            .unwrap();
        let run_id = handle.run_id().clone();
        while driver.executed().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(svc.cancel(&run_id).await);
        release.notify_one();
        let run = handle.wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.steps[1].outcome, StepOutcome::Success);
        assert_eq!(run.steps[2].outcome, StepOutcome::Skipped);
        assert_eq!(driver.executed(), vec!["open", "wait"]);
    }

    #[tokio::test]
    async fn scheduler_rejection_fails_the_run() {
        let driver = ScriptedDriver::new("fp");
        let svc = service(SchedulerConfig::default(), driver).await;
        svc.scheduler.shutdown().await;

        let err = svc
            .submit(RunRequest::new("acme", "late", steps(&["open app"])))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, RunError::Scheduler(SchedulerError::ShutDown)));
        let runs = svc.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error.as_deref().unwrap().contains("shut down"));
    }

    /// Every session hangs on its first command.
    #[derive(Default)]
    struct StuckSessions {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    struct StuckDriver {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserDriver for StuckDriver {
        async fn current_page(&self) -> Result<PageState, DriverError> {
            Ok(PageState::new(PageFingerprint::from("fp")))
        }

        async fn execute(&self, _command: &Command) -> Result<DriverOutcome, DriverError> {
            std::future::pending().await
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DriverFactory for StuckSessions {
        async fn open(&self, _run: &RunContext) -> Result<Arc<dyn BrowserDriver>, DriverError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StuckDriver {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[tokio::test]
    async fn timed_out_attempts_close_their_sessions() {
        let sessions = Arc::new(StuckSessions::default());
        let executor = RunExecutor::new(
            cache(Arc::new(VerbResolver::default())).await,
            Arc::clone(&sessions) as Arc<dyn DriverFactory>,
            Arc::new(RunRegistry::new()),
        );
        let config = SchedulerConfig {
            task_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(1),
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(SchedulerService::new(config));
        scheduler.start().await;
        let svc = TestRunService::new(scheduler, Arc::new(executor));

        let run = svc
            .submit(RunRequest::new("acme", "stuck", steps(&["click nothing"])))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        for _ in 0..50 {
            if sessions.closed.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sessions.opened.load(Ordering::SeqCst), 2);
        assert_eq!(sessions.closed.load(Ordering::SeqCst), 2);
    }
}
