use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use stepwright_core_types::{CoreError, PageState, RunContext, RunId};
use stepwright_interp_cache::InterpretationCache;
use stepwright_scheduler::{Task, TaskContext, TaskExecutor, TaskOutput};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{BrowserDriver, DriverError, DriverFactory, DriverOutcome};
use crate::errors::RunError;
use crate::model::{RunLogLevel, RunStatus, StepOutcome, TestRun};
use crate::registry::RunRegistry;

/// A transient driver failure earns exactly one more try.
const MAX_STEP_ATTEMPTS: u32 = 2;

enum StepFailure {
    Resolution(String),
    Driver(DriverError),
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Resolution(message) => f.write_str(message),
            StepFailure::Driver(err) => write!(f, "driver error: {err}"),
        }
    }
}

/// Owns an open driver session. Dropping it unclosed, as happens when the
/// scheduler abandons a timed-out attempt, closes the session in the
/// background.
struct DriverSession {
    run_id: RunId,
    driver: Arc<dyn BrowserDriver>,
    closed: bool,
}

impl DriverSession {
    fn new(run_id: RunId, driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            run_id,
            driver,
            closed: false,
        }
    }

    fn driver(&self) -> &dyn BrowserDriver {
        self.driver.as_ref()
    }

    async fn close(mut self) {
        self.closed = true;
        self.driver.close().await;
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(target: "run_executor", run = %self.run_id, "closing abandoned driver session");
                let driver = Arc::clone(&self.driver);
                handle.spawn(async move { driver.close().await });
            }
            Err(_) => {
                warn!(target: "run_executor", run = %self.run_id, "no runtime left to close driver session");
            }
        }
    }
}

enum StepResult {
    Passed(PageState),
    Failed(String),
    Cancelled,
}

/// Drives a test run step by step: resolve through the interpretation
/// cache, dispatch to the driver, record the outcome.
///
/// Runs are resumable. A run left `running` by an interrupted attempt picks
/// up at its first pending step; finished steps are never replayed.
pub struct RunExecutor {
    cache: Arc<InterpretationCache>,
    drivers: Arc<dyn DriverFactory>,
    registry: Arc<RunRegistry>,
}

impl RunExecutor {
    pub fn new(
        cache: Arc<InterpretationCache>,
        drivers: Arc<dyn DriverFactory>,
        registry: Arc<RunRegistry>,
    ) -> Self {
        Self {
            cache,
            drivers,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<InterpretationCache> {
        &self.cache
    }

    /// Execute `ctx` to a terminal state and return the final record.
    ///
    /// Step failures end up in the returned run, not in the error; `Err`
    /// means the run could not be driven at all and is still open.
    pub async fn execute_run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<TestRun, RunError> {
        let run_id = &ctx.run_id;
        match self.registry.register(ctx) {
            Ok(_) | Err(RunError::Duplicate(_)) => {}
            Err(err) => return Err(err),
        }
        if self
            .registry
            .status(run_id)
            .is_some_and(RunStatus::is_terminal)
        {
            debug!(target: "run_executor", run = %run_id, "run already finished");
            return self.snapshot(run_id);
        }
        if cancel.is_cancelled() {
            self.finish_cancelled(run_id)?;
            return self.snapshot(run_id);
        }

        let driver = match self.drivers.open(ctx).await {
            Ok(driver) => driver,
            Err(source) => {
                warn!(target: "run_executor", run = %run_id, error = %source, "could not open driver session");
                self.log(
                    run_id,
                    RunLogLevel::Warn,
                    None,
                    format!("driver session unavailable: {source}"),
                );
                return Err(RunError::Session {
                    run_id: run_id.clone(),
                    source,
                });
            }
        };

        let session = DriverSession::new(run_id.clone(), driver);
        let driven = self.drive(ctx, session.driver(), cancel).await;
        session.close().await;
        driven?;
        self.snapshot(run_id)
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        driver: &dyn BrowserDriver,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let run_id = &ctx.run_id;
        let total = ctx.steps.len();
        let mut first_error: Option<String> = None;
        let mut page: Option<PageState> = None;

        for (order, description) in ctx.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.finish_cancelled(run_id);
            }
            if let Some(step) = self.registry.step(run_id, order) {
                if step.outcome.is_final() {
                    if step.outcome == StepOutcome::Failure && first_error.is_none() {
                        first_error = step.error.map(|err| format!("step {order}: {err}"));
                    }
                    page = None;
                    continue;
                }
            }
            if self.registry.status(run_id) == Some(RunStatus::Queued) {
                self.registry.transition(run_id, RunStatus::Running, None)?;
                info!(target: "run_executor", run = %run_id, steps = total, "run started");
                self.log(run_id, RunLogLevel::Info, None, format!("run started with {total} steps"));
            }

            match self
                .run_step(run_id, order, description, driver, page.take(), cancel)
                .await?
            {
                StepResult::Passed(next) => page = Some(next),
                StepResult::Failed(reason) => {
                    let reason = format!("step {order}: {reason}");
                    if !ctx.continue_on_failure {
                        return self.finish_failed(run_id, first_error.unwrap_or(reason));
                    }
                    first_error.get_or_insert(reason);
                }
                StepResult::Cancelled => return self.finish_cancelled(run_id),
            }
        }

        if cancel.is_cancelled() {
            return self.finish_cancelled(run_id);
        }
        match first_error {
            Some(reason) => self.finish_failed(run_id, reason),
            None => {
                self.registry.transition(run_id, RunStatus::Completed, None)?;
                info!(target: "run_executor", run = %run_id, steps = total, "run completed");
                self.log(run_id, RunLogLevel::Info, None, "run completed");
                Ok(())
            }
        }
    }

    async fn run_step(
        &self,
        run_id: &RunId,
        order: usize,
        description: &str,
        driver: &dyn BrowserDriver,
        mut page: Option<PageState>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, RunError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self
                .attempt_step(run_id, order, description, driver, page.take())
                .await?
            {
                Ok(outcome) => {
                    self.registry
                        .finish_step(run_id, order, StepOutcome::Success, None)?;
                    debug!(target: "run_executor", run = %run_id, step = order, result = %outcome.result, "step succeeded");
                    self.log(run_id, RunLogLevel::Info, Some(order), "step succeeded");
                    return Ok(StepResult::Passed(outcome.page));
                }
                Err(failure) => failure,
            };

            if let StepFailure::Driver(err) = &failure {
                if err.is_transient() && attempt < MAX_STEP_ATTEMPTS && !cancel.is_cancelled() {
                    warn!(target: "run_executor", run = %run_id, step = order, error = %err, "transient driver error, retrying step");
                    self.log(
                        run_id,
                        RunLogLevel::Warn,
                        Some(order),
                        format!("{failure}; retrying"),
                    );
                    continue;
                }
            }

            let reason = failure.to_string();
            self.registry
                .finish_step(run_id, order, StepOutcome::Failure, Some(reason.clone()))?;
            self.log(run_id, RunLogLevel::Error, Some(order), reason.clone());
            if cancel.is_cancelled() {
                return Ok(StepResult::Cancelled);
            }
            error!(target: "run_executor", run = %run_id, step = order, "{reason}");
            return Ok(StepResult::Failed(reason));
        }
    }

    /// One resolve-and-dispatch pass. The page is re-read when the caller
    /// has no fresh state from the previous command.
    async fn attempt_step(
        &self,
        run_id: &RunId,
        order: usize,
        description: &str,
        driver: &dyn BrowserDriver,
        page: Option<PageState>,
    ) -> Result<Result<DriverOutcome, StepFailure>, RunError> {
        let page = match page {
            Some(page) => page,
            None => match driver.current_page().await {
                Ok(page) => page,
                Err(err) => {
                    self.registry.count_attempt(run_id, order)?;
                    return Ok(Err(StepFailure::Driver(err)));
                }
            },
        };
        let command = match self.cache.resolve(description, &page).await {
            Ok(command) => command,
            Err(err) => {
                self.registry.count_attempt(run_id, order)?;
                return Ok(Err(StepFailure::Resolution(err.to_string())));
            }
        };
        let attempt = self.registry.begin_attempt(run_id, order, command.clone())?;
        debug!(target: "run_executor", run = %run_id, step = order, attempt, "executing {command}");
        self.log(
            run_id,
            RunLogLevel::Info,
            Some(order),
            format!("attempt {attempt}: {command}"),
        );
        Ok(driver.execute(&command).await.map_err(StepFailure::Driver))
    }

    fn finish_failed(&self, run_id: &RunId, reason: String) -> Result<(), RunError> {
        self.registry.skip_pending(run_id)?;
        self.log(run_id, RunLogLevel::Error, None, format!("run failed: {reason}"));
        warn!(target: "run_executor", run = %run_id, error = %reason, "run failed");
        self.registry
            .transition(run_id, RunStatus::Failed, Some(reason))
    }

    fn finish_cancelled(&self, run_id: &RunId) -> Result<(), RunError> {
        let skipped = self.registry.skip_pending(run_id)?;
        self.registry
            .transition(run_id, RunStatus::Cancelled, None)?;
        info!(target: "run_executor", run = %run_id, skipped, "run cancelled");
        self.log(
            run_id,
            RunLogLevel::Warn,
            None,
            format!("run cancelled, {skipped} steps skipped"),
        );
        Ok(())
    }

    fn log(
        &self,
        run_id: &RunId,
        level: RunLogLevel,
        step: Option<usize>,
        message: impl Into<String>,
    ) {
        self.registry.push_log(run_id, level, step, message);
    }

    fn snapshot(&self, run_id: &RunId) -> Result<TestRun, RunError> {
        self.registry
            .get(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.clone()))
    }
}

/// Scheduler entry point. A failed run is still a finished task: its
/// outcome travels in the output value and the scheduler does not retry it.
#[async_trait]
impl TaskExecutor for RunExecutor {
    async fn execute(&self, task: &Task, ctx: TaskContext) -> Result<TaskOutput, CoreError> {
        let run = self.execute_run(task.payload(), &ctx.cancel).await?;
        if run.status == RunStatus::Cancelled {
            return Err(CoreError::cancelled());
        }
        let value = serde_json::to_value(run.summary())
            .map_err(|err| CoreError::internal(err.to_string()))?;
        Ok(TaskOutput {
            attempts: ctx.attempt,
            value: Some(value),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use stepwright_core_types::{Command, CoreError, ErrorKind, PageFingerprint, PageState};
    use stepwright_interp_cache::{AiResolver, CachePolicy, InterpretationCache, InterpretationCacheBuilder};
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use crate::adapter::{BrowserDriver, DriverError, DriverOutcome};

    /// Resolves "verb rest of sentence" into `verb({"step": ...})`.
    #[derive(Default)]
    pub struct VerbResolver {
        calls: AtomicUsize,
    }

    impl VerbResolver {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AiResolver for VerbResolver {
        async fn resolve(&self, description: &str, _page: &PageState) -> Result<Command, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let verb = description.split_whitespace().next().unwrap_or_default();
            if verb == "mumble" {
                return Err(CoreError::new(ErrorKind::Resolution, "no idea what that means"));
            }
            Ok(Command::new(verb, serde_json::json!({ "step": description })))
        }
    }

    /// Executes anything, failing per command name from a script.
    pub struct ScriptedDriver {
        page: PageState,
        failures: Mutex<HashMap<String, VecDeque<DriverError>>>,
        executed: Mutex<Vec<Command>>,
        /// Cancelled once the named command has run.
        trip: Mutex<Option<(String, CancellationToken)>>,
        /// The named command parks until notified.
        gate: Mutex<Option<(String, Arc<Notify>)>>,
    }

    impl ScriptedDriver {
        pub fn new(fingerprint: &str) -> Arc<Self> {
            Arc::new(Self {
                page: PageState::new(PageFingerprint::from(fingerprint)),
                failures: Mutex::new(HashMap::new()),
                executed: Mutex::new(Vec::new()),
                trip: Mutex::new(None),
                gate: Mutex::new(None),
            })
        }

        pub fn fail(&self, command: &str, err: DriverError) {
            self.failures
                .lock()
                .entry(command.to_string())
                .or_default()
                .push_back(err);
        }

        pub fn cancel_after(&self, command: &str, token: CancellationToken) {
            *self.trip.lock() = Some((command.to_string(), token));
        }

        pub fn hold(&self, command: &str) -> Arc<Notify> {
            let notify = Arc::new(Notify::new());
            *self.gate.lock() = Some((command.to_string(), Arc::clone(&notify)));
            notify
        }

        pub fn executed(&self) -> Vec<String> {
            self.executed.lock().iter().map(|c| c.name.clone()).collect()
        }
    }

    #[async_trait]
    impl BrowserDriver for ScriptedDriver {
        async fn current_page(&self) -> Result<PageState, DriverError> {
            Ok(self.page.clone())
        }

        async fn execute(&self, command: &Command) -> Result<DriverOutcome, DriverError> {
            self.executed.lock().push(command.clone());
            let gate = self
                .gate
                .lock()
                .as_ref()
                .filter(|(name, _)| *name == command.name)
                .map(|(_, notify)| Arc::clone(notify));
            if let Some(notify) = gate {
                notify.notified().await;
            }
            if let Some((name, token)) = self.trip.lock().as_ref() {
                if *name == command.name {
                    token.cancel();
                }
            }
            if let Some(err) = self
                .failures
                .lock()
                .get_mut(&command.name)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            Ok(DriverOutcome {
                result: serde_json::json!({ "ok": true }),
                page: self.page.clone(),
            })
        }
    }

    pub async fn cache(resolver: Arc<VerbResolver>) -> Arc<InterpretationCache> {
        InterpretationCacheBuilder::new(CachePolicy::default(), resolver)
            .without_background_tasks()
            .build()
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stepwright_core_types::{ErrorKind, RunContext};
    use stepwright_scheduler::{Priority, Task, TaskContext, TaskExecutor};
    use tokio_util::sync::CancellationToken;

    use super::testing::{cache, ScriptedDriver, VerbResolver};
    use super::*;
    use crate::adapter::SharedDriver;
    use crate::model::RunSummary;

    async fn executor(driver: Arc<ScriptedDriver>) -> (RunExecutor, Arc<VerbResolver>) {
        let resolver = Arc::new(VerbResolver::default());
        let cache = cache(Arc::clone(&resolver)).await;
        let exec = RunExecutor::new(
            cache,
            Arc::new(SharedDriver(driver)),
            Arc::new(RunRegistry::new()),
        );
        (exec, resolver)
    }

    fn run(steps: &[&str]) -> RunContext {
        RunContext::new("checkout", steps.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let driver = ScriptedDriver::new("fp-home");
        let (exec, _) = executor(Arc::clone(&driver)).await;
        let ctx = run(&["open the shop", "click add to cart", "submit order"]);

        let result = exec.execute_run(&ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.error.is_none());
        assert!(result.started_at.is_some() && result.ended_at.is_some());
        assert!(result
            .steps
            .iter()
            .all(|s| s.outcome == StepOutcome::Success && s.resolved_command.is_some()));
        assert_eq!(driver.executed(), vec!["open", "click", "submit"]);
        assert!(result.logs.iter().any(|l| l.message == "run completed"));
    }

    #[tokio::test]
    async fn empty_run_completes_immediately() {
        let driver = ScriptedDriver::new("fp");
        let (exec, _) = executor(driver).await;
        let result = exec
            .execute_run(&run(&[]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.started_at.is_none());
    }

    #[tokio::test]
    async fn transient_error_is_retried_once() {
        let driver = ScriptedDriver::new("fp");
        driver.fail("click", DriverError::detached("button re-rendered"));
        let (exec, _) = executor(Arc::clone(&driver)).await;

        let result = exec
            .execute_run(&run(&["click save", "check banner"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps[0].attempts, 2);
        assert_eq!(driver.executed(), vec!["click", "click", "check"]);
        assert!(result
            .logs
            .iter()
            .any(|l| l.level == RunLogLevel::Warn && l.step == Some(0)));
    }

    #[tokio::test]
    async fn second_transient_error_fails_the_run() {
        let driver = ScriptedDriver::new("fp");
        driver.fail("click", DriverError::timeout("no response"));
        driver.fail("click", DriverError::timeout("still no response"));
        let (exec, _) = executor(Arc::clone(&driver)).await;

        let result = exec
            .execute_run(&run(&["click save", "check banner"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps[0].outcome, StepOutcome::Failure);
        assert_eq!(result.steps[0].attempts, 2);
        assert_eq!(result.steps[1].outcome, StepOutcome::Skipped);
        assert!(result.error.unwrap().contains("still no response"));
    }

    #[tokio::test]
    async fn fatal_error_stops_the_run() {
        let driver = ScriptedDriver::new("fp");
        driver.fail("click", DriverError::other("element not found"));
        let (exec, _) = executor(Arc::clone(&driver)).await;

        let result = exec
            .execute_run(
                &run(&["open page", "click missing", "type hello"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let outcomes: Vec<_> = result.steps.iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![StepOutcome::Success, StepOutcome::Failure, StepOutcome::Skipped]
        );
        assert_eq!(result.steps[1].attempts, 1);
        assert_eq!(driver.executed(), vec!["open", "click"]);
        assert!(result.error.unwrap().starts_with("step 1:"));
    }

    #[tokio::test]
    async fn resolution_failure_is_fatal_for_the_step() {
        let driver = ScriptedDriver::new("fp");
        let (exec, resolver) = executor(Arc::clone(&driver)).await;

        let result = exec
            .execute_run(&run(&["mumble something", "open page"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.steps[0].resolved_command.is_none());
        assert_eq!(resolver.calls(), 1);
        assert!(driver.executed().is_empty());
    }

    #[tokio::test]
    async fn continue_on_failure_keeps_first_error() {
        let driver = ScriptedDriver::new("fp");
        driver.fail("click", DriverError::other("first failure"));
        driver.fail("type", DriverError::other("second failure"));
        let (exec, _) = executor(Arc::clone(&driver)).await;
        let mut ctx = run(&["click a", "type b", "open c"]);
        ctx.continue_on_failure = true;

        let result = exec.execute_run(&ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(driver.executed(), vec!["click", "type", "open"]);
        assert_eq!(result.steps[2].outcome, StepOutcome::Success);
        let error = result.error.unwrap();
        assert!(error.contains("first failure"), "{error}");
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_steps() {
        let driver = ScriptedDriver::new("fp");
        let cancel = CancellationToken::new();
        driver.cancel_after("click", cancel.clone());
        let (exec, _) = executor(Arc::clone(&driver)).await;

        let result = exec
            .execute_run(&run(&["open page", "click go", "type x", "submit"]), &cancel)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.error.is_none());
        let outcomes: Vec<_> = result.steps.iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                StepOutcome::Success,
                StepOutcome::Success,
                StepOutcome::Skipped,
                StepOutcome::Skipped
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_never_touches_the_driver() {
        let driver = ScriptedDriver::new("fp");
        let (exec, resolver) = executor(Arc::clone(&driver)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = exec.execute_run(&run(&["open page"]), &cancel).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.steps[0].outcome, StepOutcome::Skipped);
        assert_eq!(resolver.calls(), 0);
        assert!(driver.executed().is_empty());
    }

    #[tokio::test]
    async fn repeated_steps_reuse_cached_commands() {
        let driver = ScriptedDriver::new("fp-login");
        let (exec, resolver) = executor(Arc::clone(&driver)).await;
        let steps = ["type the username", "click sign in"];

        for _ in 0..3 {
            let result = exec
                .execute_run(&run(&steps), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(result.status, RunStatus::Completed);
        }

        assert_eq!(resolver.calls(), 2);
        assert_eq!(driver.executed().len(), 6);
    }

    #[tokio::test]
    async fn finished_runs_are_not_replayed() {
        let driver = ScriptedDriver::new("fp");
        let (exec, _) = executor(Arc::clone(&driver)).await;
        let ctx = run(&["open page"]);

        exec.execute_run(&ctx, &CancellationToken::new()).await.unwrap();
        let again = exec.execute_run(&ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(again.status, RunStatus::Completed);
        assert_eq!(driver.executed().len(), 1);
    }

    #[tokio::test]
    async fn task_executor_reports_run_summary() {
        let driver = ScriptedDriver::new("fp");
        driver.fail("click", DriverError::other("gone"));
        let (exec, _) = executor(driver).await;
        let task = Task::new("acme", Priority::High, run(&["click it", "open it"]));

        let output = exec
            .execute(
                &task,
                TaskContext {
                    attempt: 1,
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap();

        let summary: RunSummary = serde_json::from_value(output.value.unwrap()).unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = Task::new("acme", Priority::High, run(&["open it"]));
        let err = exec
            .execute(&cancelled, TaskContext { attempt: 1, cancel })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
