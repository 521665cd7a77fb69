use std::sync::Arc;
use std::time::Instant;

use stepwright_core_types::{CoreError, TaskId};
use stepwright_event_bus::{EventBus, InMemoryBus};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::TaskHandle;
use crate::error::SchedulerError;
use crate::events::TaskEvent;
use crate::executor::TaskExecutor;
use crate::model::{Task, TaskContext, TaskOutput, TaskSummary};
use crate::runtime::{CancelOutcome, ReadyTask, SchedulerRuntime};

pub struct Orchestrator {
    runtime: Arc<SchedulerRuntime>,
    bus: Arc<InMemoryBus<TaskEvent>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<SchedulerRuntime>, bus: Arc<InMemoryBus<TaskEvent>>) -> Self {
        Self {
            runtime,
            bus,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn runtime(&self) -> &Arc<SchedulerRuntime> {
        &self.runtime
    }

    pub fn bus(&self) -> &Arc<InMemoryBus<TaskEvent>> {
        &self.bus
    }

    /// Start the dispatcher loop once; later calls are no-ops.
    pub async fn spawn(&self) {
        let mut guard = self.worker.lock().await;
        if guard.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let runtime = Arc::clone(&self.runtime);
        let bus = Arc::clone(&self.bus);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                while let Some(ready) = runtime.take_ready() {
                    let summary = ready.task.summary();
                    debug!(
                        target: "scheduler",
                        task_id = %summary.id,
                        tenant = %summary.tenant_id,
                        wait_ms = ready.queue_wait.as_millis() as u64,
                        "task admitted"
                    );
                    publish(&bus, TaskEvent::TaskStarted { task: summary }).await;
                    tokio::spawn(run_task(Arc::clone(&runtime), Arc::clone(&bus), ready));
                }
                tokio::select! {
                    _ = runtime.changed() => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!(target: "scheduler", "dispatcher stopped");
        });
        *guard = Some(handle);
    }

    pub async fn enqueue(
        &self,
        task: Task,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<TaskHandle, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        self.spawn().await;
        let summary = task.summary();
        let (tx, rx) = oneshot::channel();
        let bus = &self.bus;
        self.runtime
            .enqueue(task, executor, tx, |task| {
                bus.emit(TaskEvent::TaskQueued {
                    task: task.summary(),
                });
            })
            .map_err(|(err, _)| err)?;
        info!(
            target: "scheduler",
            task_id = %summary.id,
            tenant = %summary.tenant_id,
            priority = ?summary.priority,
            pending = self.runtime.pending(),
            "task queued"
        );
        self.runtime.wake();
        Ok(TaskHandle::new(summary.id, rx))
    }

    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        match self.runtime.cancel(task_id) {
            CancelOutcome::Dequeued(task, completion) => {
                let _ = completion.send(Err(SchedulerError::Cancelled));
                self.runtime.metrics().record_cancelled();
                let summary = task.summary();
                log_cancelled(&summary, 0, self.runtime.pending());
                publish(&self.bus, TaskEvent::TaskCancelled { task: summary }).await;
                true
            }
            CancelOutcome::Signalled => {
                debug!(target: "scheduler", task_id = %task_id, "cancellation signalled");
                true
            }
            CancelOutcome::NotFound => false,
        }
    }

    /// Stop admitting work. Queued tasks resolve as shut down, running
    /// tasks see their cancellation token tripped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for (task, completion) in self.runtime.close() {
            let _ = completion.send(Err(SchedulerError::ShutDown));
            self.runtime.metrics().record_cancelled();
            publish(&self.bus, TaskEvent::TaskCancelled { task: task.summary() }).await;
        }
        self.runtime.cancel_all_active();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        info!(target: "scheduler", "scheduler shut down");
    }
}

async fn run_task(runtime: Arc<SchedulerRuntime>, bus: Arc<InMemoryBus<TaskEvent>>, ready: ReadyTask) {
    let config = runtime.config();
    let max_attempts = config.retry_attempts.saturating_add(1);
    let cancel = ready.cancel.clone();
    let started = Instant::now();
    let mut attempt: u32 = 0;

    let result: Result<TaskOutput, SchedulerError> = loop {
        if cancel.is_cancelled() {
            break Err(SchedulerError::Cancelled);
        }
        attempt += 1;
        let ctx = TaskContext {
            attempt,
            cancel: cancel.clone(),
        };
        let exec =
            tokio::time::timeout(config.task_timeout, ready.executor.execute(&ready.task, ctx)).await;
        let current_err = match exec {
            Ok(Ok(_)) if cancel.is_cancelled() => break Err(SchedulerError::Cancelled),
            Ok(Ok(mut output)) => {
                output.attempts = attempt;
                break Ok(output);
            }
            Ok(Err(err)) => SchedulerError::from_executor(err),
            Err(_) => SchedulerError::Timeout(config.task_timeout),
        };

        if current_err.is_cancelled() || cancel.is_cancelled() {
            break Err(SchedulerError::Cancelled);
        }
        if attempt >= max_attempts {
            break Err(current_err);
        }

        runtime.metrics().record_retried();
        warn!(
            target: "scheduler",
            task_id = %ready.task.id(),
            attempt,
            error = %current_err,
            "task attempt failed; retrying"
        );
        let backoff = config.retry_backoff * attempt;
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = cancel.cancelled() => break Err(SchedulerError::Cancelled),
        }
    };

    let elapsed = started.elapsed();
    let (task, completion) = ready.release();
    let summary = task.summary();
    let pending = runtime.pending();
    let event = match &result {
        Ok(_) => {
            runtime.metrics().record_completed(elapsed);
            info!(
                target: "scheduler",
                task_id = %summary.id,
                tenant = %summary.tenant_id,
                attempts = attempt,
                run_ms = elapsed.as_millis() as u64,
                pending,
                "task completed"
            );
            TaskEvent::TaskCompleted {
                task: summary,
                attempts: attempt,
            }
        }
        Err(err) if err.is_cancelled() => {
            runtime.metrics().record_cancelled();
            log_cancelled(&summary, attempt, pending);
            TaskEvent::TaskCancelled { task: summary }
        }
        Err(err) => {
            runtime.metrics().record_failed(elapsed);
            warn!(
                target: "scheduler",
                task_id = %summary.id,
                tenant = %summary.tenant_id,
                attempts = attempt,
                run_ms = elapsed.as_millis() as u64,
                pending,
                error = %err,
                "task failed"
            );
            TaskEvent::TaskFailed {
                task: summary,
                attempts: attempt,
                error: CoreError::from(err.clone()),
            }
        }
    };
    let _ = completion.send(result);
    publish(&bus, event).await;
}

fn log_cancelled(task: &TaskSummary, attempts: u32, pending: usize) {
    warn!(
        target: "scheduler",
        task_id = %task.id,
        tenant = %task.tenant_id,
        attempts,
        pending,
        "task cancelled"
    );
}

async fn publish(bus: &InMemoryBus<TaskEvent>, event: TaskEvent) {
    let name = event.name();
    if let Err(err) = bus.publish(event).await {
        warn!(target: "scheduler", event = name, "event publish failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use parking_lot::Mutex as SyncMutex;
    use stepwright_core_types::{ErrorKind, RunContext};
    use tokio::sync::Notify;

    use crate::api::{Scheduler, SchedulerService};
    use crate::executor::FnExecutor;
    use crate::model::{Priority, SchedulerConfig, TaskState};

    use super::*;

    fn config(global: usize, tenant: usize, retries: u32) -> SchedulerConfig {
        SchedulerConfig {
            global_limit: global,
            per_tenant_limit: tenant,
            retry_attempts: retries,
            retry_backoff: Duration::ZERO,
            task_timeout: Duration::from_secs(5),
            ..SchedulerConfig::default()
        }
    }

    fn task(id: &str, tenant: &str, priority: Priority) -> Task {
        Task::new(tenant, priority, RunContext::default()).with_id(id)
    }

    /// Records task ids in start order; the task named `blocker` parks on `gate`.
    fn gated_recorder(
        order: Arc<SyncMutex<Vec<String>>>,
        started: Arc<Notify>,
        gate: Arc<Notify>,
    ) -> Arc<dyn TaskExecutor> {
        FnExecutor::new(move |task, ctx| {
            let order = Arc::clone(&order);
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            async move {
                order.lock().push(task.id().to_string());
                if task.id().as_str() == "blocker" {
                    started.notify_one();
                    gate.notified().await;
                }
                Ok::<_, CoreError>(TaskOutput {
                    attempts: ctx.attempt,
                    value: None,
                })
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn higher_priority_runs_first_once_a_slot_frees() {
        let service = SchedulerService::new(config(1, 4, 0));
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let exec = gated_recorder(Arc::clone(&order), Arc::clone(&started), Arc::clone(&gate));

        let blocker = service
            .enqueue(task("blocker", "t1", Priority::Low), Arc::clone(&exec))
            .await
            .unwrap();
        started.notified().await;

        let mut handles = Vec::new();
        for (id, priority) in [
            ("low", Priority::Low),
            ("high", Priority::High),
            ("medium", Priority::Medium),
        ] {
            handles.push(
                service
                    .enqueue(task(id, "t1", priority), Arc::clone(&exec))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(service.status(&TaskId::from("high")), TaskState::Queued);
        assert_eq!(service.status(&TaskId::from("blocker")), TaskState::Active);

        gate.notify_one();
        blocker.wait().await.unwrap();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["blocker", "high", "medium", "low"]);
        assert_eq!(service.status(&TaskId::from("low")), TaskState::Absent);
    }

    fn concurrency_gauge(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<dyn TaskExecutor> {
        FnExecutor::new(move |_task, ctx| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, CoreError>(TaskOutput {
                    attempts: ctx.attempt,
                    value: None,
                })
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn tenant_limit_bounds_one_tenants_concurrency() {
        let service = SchedulerService::new(config(5, 2, 0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let exec = concurrency_gauge(Arc::clone(&running), Arc::clone(&peak));

        let mut handles = Vec::new();
        for i in 0..5 {
            let t = task(&format!("a-{i}"), "tenant-a", Priority::Medium);
            handles.push(service.enqueue(t, Arc::clone(&exec)).await.unwrap());
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(service.metrics().completed, 5);
    }

    #[tokio::test]
    async fn global_limit_holds_across_tenants() {
        let service = SchedulerService::new(config(2, 2, 0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let exec = concurrency_gauge(Arc::clone(&running), Arc::clone(&peak));

        let mut handles = Vec::new();
        for tenant in ["a", "b", "c"] {
            for i in 0..2 {
                let t = task(&format!("{tenant}-{i}"), tenant, Priority::Medium);
                handles.push(service.enqueue(t, Arc::clone(&exec)).await.unwrap());
            }
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failing_executor_is_attempted_retry_attempts_plus_one_times() {
        let service = SchedulerService::new(config(1, 1, 2));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let exec: Arc<dyn TaskExecutor> = FnExecutor::new(move |_task, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<TaskOutput, _>(CoreError::new(ErrorKind::FatalStep, "boom")) }.boxed()
        });

        let handle = service
            .enqueue(task("flaky", "t", Priority::High), exec)
            .await
            .unwrap();
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalStep);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(service.metrics().retried, 2);
    }

    #[tokio::test]
    async fn hung_first_attempt_times_out_then_retry_completes() {
        let mut cfg = config(1, 1, 1);
        cfg.task_timeout = Duration::from_millis(50);
        let service = SchedulerService::new(cfg);
        let exec: Arc<dyn TaskExecutor> = FnExecutor::new(|_task, ctx| {
            async move {
                if ctx.attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, CoreError>(TaskOutput {
                    attempts: ctx.attempt,
                    value: None,
                })
            }
            .boxed()
        });

        let output = service
            .enqueue(task("slow", "t", Priority::Medium), exec)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(output.attempts, 2);
    }

    #[tokio::test]
    async fn timeout_without_retries_fails_with_timeout_kind() {
        let mut cfg = config(1, 1, 0);
        cfg.task_timeout = Duration::from_millis(20);
        let service = SchedulerService::new(cfg);
        let exec: Arc<dyn TaskExecutor> = FnExecutor::new(|_task, _ctx| {
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CoreError>(TaskOutput::default())
            }
            .boxed()
        });
        let err = service
            .enqueue(task("hang", "t", Priority::Medium), exec)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::TaskTimeout);
    }

    #[tokio::test]
    async fn cancelling_a_queued_task_means_it_never_runs() {
        let service = SchedulerService::new(config(1, 1, 0));
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let exec = gated_recorder(Arc::clone(&order), Arc::clone(&started), Arc::clone(&gate));

        let blocker = service
            .enqueue(task("blocker", "t", Priority::Medium), Arc::clone(&exec))
            .await
            .unwrap();
        started.notified().await;
        let victim = service
            .enqueue(task("victim", "t", Priority::High), Arc::clone(&exec))
            .await
            .unwrap();

        assert!(service.cancel(&TaskId::from("victim")).await);
        assert!(victim.wait().await.unwrap_err().is_cancelled());
        gate.notify_one();
        blocker.wait().await.unwrap();

        assert_eq!(*order.lock(), vec!["blocker"]);
        assert!(!service.cancel(&TaskId::from("victim")).await);
        assert!(!service.cancel(&TaskId::from("blocker")).await);
    }

    #[tokio::test]
    async fn cancelled_running_task_is_not_retried() {
        let service = SchedulerService::new(config(1, 1, 3));
        let started = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let (signal, counter) = (Arc::clone(&started), Arc::clone(&calls));
        let exec: Arc<dyn TaskExecutor> = FnExecutor::new(move |_task, ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            let signal = Arc::clone(&signal);
            async move {
                signal.notify_one();
                ctx.cancel.cancelled().await;
                Err::<TaskOutput, _>(CoreError::cancelled())
            }
            .boxed()
        });

        let handle = service
            .enqueue(task("long", "t", Priority::Medium), exec)
            .await
            .unwrap();
        started.notified().await;
        assert!(service.cancel(handle.task_id()).await);
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_cancellation_still_reports_cancelled() {
        let service = SchedulerService::new(config(1, 1, 0));
        let started = Arc::new(Notify::new());
        let signal = Arc::clone(&started);
        let exec: Arc<dyn TaskExecutor> = FnExecutor::new(move |_task, ctx| {
            let signal = Arc::clone(&signal);
            async move {
                signal.notify_one();
                ctx.cancel.cancelled().await;
                Ok::<_, CoreError>(TaskOutput::default())
            }
            .boxed()
        });

        let handle = service
            .enqueue(task("ignores-flag", "t", Priority::Medium), exec)
            .await
            .unwrap();
        started.notified().await;
        service.cancel(handle.task_id()).await;
        assert!(handle.wait().await.unwrap_err().is_cancelled());
        assert_eq!(service.metrics().completed, 0);
        assert_eq!(service.metrics().cancelled, 1);
    }

    #[tokio::test]
    async fn lifecycle_events_reach_subscribers() {
        let service = SchedulerService::new(config(2, 2, 0));
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = service.on_task_event(move |event| {
            sink.lock().push((event.task().id.to_string(), event.name()));
        });

        let ok: Arc<dyn TaskExecutor> = Arc::new(crate::executor::NoopExecutor);
        let bad: Arc<dyn TaskExecutor> = FnExecutor::new(|_task, _ctx| {
            async { Err::<TaskOutput, _>(CoreError::new(ErrorKind::FatalStep, "no such element")) }
                .boxed()
        });
        service
            .enqueue(task("good", "t", Priority::Medium), ok)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        service
            .enqueue(task("bad", "t", Priority::Medium), bad)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().clone();
        let names_for = |id: &str| -> Vec<&'static str> {
            seen.iter()
                .filter(|(task_id, _)| task_id == id)
                .map(|(_, name)| *name)
                .collect()
        };
        assert_eq!(names_for("good"), vec!["task_queued", "task_started", "task_completed"]);
        assert_eq!(names_for("bad"), vec!["task_queued", "task_started", "task_failed"]);
    }

    #[tokio::test]
    async fn queue_status_reports_waiting_and_active() {
        let service = SchedulerService::new(config(1, 1, 0));
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let exec = gated_recorder(order, Arc::clone(&started), Arc::clone(&gate));

        let blocker = service
            .enqueue(task("blocker", "t", Priority::Medium), Arc::clone(&exec))
            .await
            .unwrap();
        started.notified().await;
        let queued = service
            .enqueue(task("next", "t", Priority::Medium), Arc::clone(&exec))
            .await
            .unwrap();

        let status = service.queue_status();
        assert_eq!(status.global.size, 1);
        assert_eq!(status.global.pending, 1);
        assert_eq!(status.global.concurrency, 1);
        assert_eq!(status.active[0].id.as_str(), "blocker");
        assert_eq!(status.waiting[0].id.as_str(), "next");
        assert!(status.estimated_wait > Duration::ZERO);

        gate.notify_one();
        blocker.wait().await.unwrap();
        queued.wait().await.unwrap();
        assert_eq!(service.queue_status().global.pending, 0);
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_rejected() {
        let service = SchedulerService::new(config(1, 1, 0));
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let exec = gated_recorder(order, Arc::clone(&started), Arc::clone(&gate));

        let first = service
            .enqueue(task("blocker", "t", Priority::Medium), Arc::clone(&exec))
            .await
            .unwrap();
        started.notified().await;
        let err = service
            .enqueue(task("blocker", "t", Priority::Medium), exec)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::DuplicateTask(_)));
        gate.notify_one();
        first.wait().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_resolves_queued_work_and_rejects_new_tasks() {
        let service = SchedulerService::new(config(1, 1, 0));
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let exec = gated_recorder(Arc::clone(&order), Arc::clone(&started), Arc::clone(&gate));

        let blocker = service
            .enqueue(task("blocker", "t", Priority::Medium), Arc::clone(&exec))
            .await
            .unwrap();
        started.notified().await;
        let queued = service
            .enqueue(task("late", "t", Priority::Medium), Arc::clone(&exec))
            .await
            .unwrap();

        service.shutdown().await;
        assert!(matches!(queued.wait().await, Err(SchedulerError::ShutDown)));
        gate.notify_one();
        assert!(blocker.wait().await.unwrap_err().is_cancelled());
        assert!(matches!(
            service
                .enqueue(task("after", "t", Priority::Medium), exec)
                .await
                .err(),
            Some(SchedulerError::ShutDown)
        ));
        assert_eq!(*order.lock(), vec!["blocker"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_event_always_precedes_started() {
        let service = Arc::new(SchedulerService::new(config(4, 4, 0)));
        service.start().await;
        let mut rx = service.events().subscribe();

        let mut joins = Vec::new();
        for i in 0..40 {
            let service = Arc::clone(&service);
            joins.push(tokio::spawn(async move {
                let exec: Arc<dyn TaskExecutor> = Arc::new(crate::executor::NoopExecutor);
                let tenant = format!("tenant{}", i % 3);
                service
                    .enqueue(task(&format!("t{i}"), &tenant, Priority::Medium), exec)
                    .await
                    .unwrap()
                    .wait()
                    .await
                    .unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        let mut queued = std::collections::HashSet::new();
        let mut started = 0;
        while let Ok(event) = rx.try_recv() {
            let id = event.task().id.to_string();
            match event {
                TaskEvent::TaskQueued { .. } => {
                    queued.insert(id);
                }
                TaskEvent::TaskStarted { .. } => {
                    assert!(queued.contains(&id), "{id} started before it was queued");
                    started += 1;
                }
                _ => {}
            }
        }
        assert_eq!(started, 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn enqueue_racing_shutdown_never_strands_a_handle() {
        let service = Arc::new(SchedulerService::new(config(1, 1, 0)));
        let blocker: Arc<dyn TaskExecutor> = FnExecutor::new(|_task, ctx| {
            async move {
                ctx.cancel.cancelled().await;
                Ok::<_, CoreError>(TaskOutput {
                    attempts: ctx.attempt,
                    value: None,
                })
            }
            .boxed()
        });

        let mut joins = Vec::new();
        for i in 0..32 {
            let service = Arc::clone(&service);
            let exec = Arc::clone(&blocker);
            joins.push(tokio::spawn(async move {
                match service
                    .enqueue(task(&format!("r{i}"), "t", Priority::Medium), exec)
                    .await
                {
                    Ok(handle) => Some(handle.wait().await),
                    Err(err) => {
                        assert!(matches!(err, SchedulerError::ShutDown));
                        None
                    }
                }
            }));
        }
        tokio::task::yield_now().await;
        service.shutdown().await;

        for join in joins {
            let outcome = tokio::time::timeout(Duration::from_secs(5), join)
                .await
                .expect("handle never resolved")
                .unwrap();
            if let Some(result) = outcome {
                assert!(
                    matches!(result, Err(SchedulerError::ShutDown | SchedulerError::Cancelled)),
                    "{result:?}"
                );
            }
        }
    }
}
