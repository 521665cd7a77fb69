use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stepwright_core_types::{TaskId, TenantId};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SchedulerError;
use crate::executor::TaskExecutor;
use crate::lane::{Job, PriorityLane};
use crate::metrics::SchedulerMetrics;
use crate::model::{GlobalStatus, QueueStatus, SchedulerConfig, Task, TaskState, TaskSummary};

/// Fallback per-task estimate before any task has finished.
const DEFAULT_RUN_ESTIMATE: Duration = Duration::from_secs(30);

pub type Completion = oneshot::Sender<Result<crate::model::TaskOutput, SchedulerError>>;

struct QueuedEntry {
    task: Task,
    executor: Arc<dyn TaskExecutor>,
    completion: Completion,
    enqueued_at: Instant,
}

struct ActiveEntry {
    summary: TaskSummary,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RuntimeState {
    lanes: HashMap<TenantId, PriorityLane>,
    /// Round-robin order of tenants that have queued work.
    order: Vec<TenantId>,
    cursor: usize,
    queued: HashMap<TaskId, QueuedEntry>,
    active: HashMap<TaskId, ActiveEntry>,
    tenant_active: HashMap<TenantId, usize>,
    global_active: usize,
    /// Set by `close`; no task is accepted afterwards.
    closed: bool,
}

/// Work that has been granted both a global and a tenant slot.
pub struct ReadyTask {
    pub task: Task,
    pub executor: Arc<dyn TaskExecutor>,
    pub completion: Completion,
    pub cancel: CancellationToken,
    pub queue_wait: Duration,
    slot: SlotGuard,
}

impl ReadyTask {
    /// Release both slots; called once the task is terminal.
    pub fn release(self) -> (Task, Completion) {
        drop(self.slot);
        (self.task, self.completion)
    }
}

/// Frees the task's slots on drop so a panicking executor cannot leak them.
struct SlotGuard {
    runtime: Arc<SchedulerRuntime>,
    task_id: TaskId,
    tenant_id: TenantId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.runtime.release_slots(&self.task_id, &self.tenant_id);
    }
}

pub enum CancelOutcome {
    /// Removed before it ever started.
    Dequeued(Task, Completion),
    /// Running; its token has been tripped.
    Signalled,
    NotFound,
}

/// Queue and slot bookkeeping. Every mutation happens under one lock.
pub struct SchedulerRuntime {
    state: Mutex<RuntimeState>,
    config: Mutex<SchedulerConfig>,
    seq: AtomicU64,
    notify: Notify,
    metrics: SchedulerMetrics,
}

impl SchedulerRuntime {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RuntimeState::default()),
            config: Mutex::new(config),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            metrics: SchedulerMetrics::default(),
        })
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.lock().clone()
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Resolves once something changed that may make a task runnable.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Queue `task`. `on_queued` runs under the state lock, before the
    /// dispatcher can observe the task.
    pub fn enqueue<F>(
        &self,
        task: Task,
        executor: Arc<dyn TaskExecutor>,
        completion: Completion,
        on_queued: F,
    ) -> Result<(), (SchedulerError, Completion)>
    where
        F: FnOnce(&Task),
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err((SchedulerError::ShutDown, completion));
        }
        let id = task.id().clone();
        if state.queued.contains_key(&id) || state.active.contains_key(&id) {
            return Err((SchedulerError::DuplicateTask(id), completion));
        }
        on_queued(&task);
        let tenant = task.tenant_id().clone();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        state
            .lanes
            .entry(tenant.clone())
            .or_default()
            .push(Job::new(id.clone(), task.priority(), seq));
        if !state.order.contains(&tenant) {
            state.order.push(tenant);
        }
        state.queued.insert(
            id,
            QueuedEntry {
                task,
                executor,
                completion,
                enqueued_at: Instant::now(),
            },
        );
        drop(state);
        self.metrics.record_enqueued();
        Ok(())
    }

    /// Wake the dispatcher after new work was enqueued.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Admit the next runnable task, if a global slot and that task's tenant
    /// slot are both free. Both are taken in the same critical section.
    pub fn take_ready(self: &Arc<Self>) -> Option<ReadyTask> {
        let (global_limit, tenant_limit) = {
            let cfg = self.config.lock();
            (cfg.global_limit, cfg.per_tenant_limit)
        };
        let mut state = self.state.lock();
        if state.global_active >= global_limit || state.order.is_empty() {
            return None;
        }

        let len = state.order.len();
        let start = state.cursor % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let tenant = state.order[idx].clone();
            let busy = state.tenant_active.get(&tenant).copied().unwrap_or(0);
            if busy >= tenant_limit {
                continue;
            }
            let Some(job) = state.lanes.get_mut(&tenant).and_then(PriorityLane::pop) else {
                continue;
            };
            let Some(entry) = state.queued.remove(&job.id) else {
                warn!(target: "scheduler", task_id = %job.id, "lane entry without queued task");
                continue;
            };

            if state.lanes.get(&tenant).map_or(true, PriorityLane::is_empty) {
                state.lanes.remove(&tenant);
                state.order.remove(idx);
                state.cursor = if state.order.is_empty() { 0 } else { idx % state.order.len() };
            } else {
                state.cursor = (idx + 1) % len;
            }

            *state.tenant_active.entry(tenant.clone()).or_insert(0) += 1;
            state.global_active += 1;
            let cancel = CancellationToken::new();
            state.active.insert(
                job.id.clone(),
                ActiveEntry {
                    summary: entry.task.summary(),
                    cancel: cancel.clone(),
                },
            );
            drop(state);

            self.metrics.record_started();
            return Some(ReadyTask {
                queue_wait: entry.enqueued_at.elapsed(),
                slot: SlotGuard {
                    runtime: Arc::clone(self),
                    task_id: job.id,
                    tenant_id: tenant,
                },
                task: entry.task,
                executor: entry.executor,
                completion: entry.completion,
                cancel,
            });
        }
        None
    }

    fn release_slots(&self, task_id: &TaskId, tenant: &TenantId) {
        let mut state = self.state.lock();
        if state.active.remove(task_id).is_none() {
            return;
        }
        state.global_active = state.global_active.saturating_sub(1);
        if let Some(count) = state.tenant_active.get_mut(tenant) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.tenant_active.remove(tenant);
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    pub fn cancel(&self, task_id: &TaskId) -> CancelOutcome {
        let mut state = self.state.lock();
        if let Some(entry) = state.queued.remove(task_id) {
            let tenant = entry.task.tenant_id().clone();
            if let Some(lane) = state.lanes.get_mut(&tenant) {
                lane.remove(task_id);
                if lane.is_empty() {
                    state.lanes.remove(&tenant);
                    state.order.retain(|t| t != &tenant);
                }
            }
            return CancelOutcome::Dequeued(entry.task, entry.completion);
        }
        if let Some(active) = state.active.get(task_id) {
            active.cancel.cancel();
            return CancelOutcome::Signalled;
        }
        CancelOutcome::NotFound
    }

    /// Drain every queued task, e.g. on shutdown.
    /// Refuse further work and hand back everything still queued.
    pub fn close(&self) -> Vec<(Task, Completion)> {
        let mut state = self.state.lock();
        state.closed = true;
        state.lanes.clear();
        state.order.clear();
        state.cursor = 0;
        state
            .queued
            .drain()
            .map(|(_, entry)| (entry.task, entry.completion))
            .collect()
    }

    pub fn cancel_all_active(&self) {
        for entry in self.state.lock().active.values() {
            entry.cancel.cancel();
        }
    }

    pub fn status(&self, task_id: &TaskId) -> TaskState {
        let state = self.state.lock();
        if state.queued.contains_key(task_id) {
            TaskState::Queued
        } else if state.active.contains_key(task_id) {
            TaskState::Active
        } else {
            TaskState::Absent
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn active(&self) -> usize {
        self.state.lock().global_active
    }

    pub fn tenant_active(&self, tenant: &TenantId) -> usize {
        self.state.lock().tenant_active.get(tenant).copied().unwrap_or(0)
    }

    pub fn queue_status(&self) -> QueueStatus {
        let concurrency = self.config.lock().global_limit;
        let state = self.state.lock();
        let mut waiting: Vec<(u64, TaskSummary)> = state
            .lanes
            .values()
            .flat_map(|lane| lane.iter())
            .filter_map(|job| {
                state
                    .queued
                    .get(&job.id)
                    .map(|entry| (job.seq, entry.task.summary()))
            })
            .collect();
        waiting.sort_by_key(|(seq, summary)| (summary.priority.weight(), *seq));
        let waiting: Vec<TaskSummary> = waiting.into_iter().map(|(_, s)| s).collect();
        let active: Vec<TaskSummary> = state.active.values().map(|a| a.summary.clone()).collect();
        drop(state);

        let per_task = self
            .metrics
            .average_run_time()
            .unwrap_or(DEFAULT_RUN_ESTIMATE);
        let rounds = waiting.len().div_ceil(concurrency.max(1)) as u32;
        QueueStatus {
            global: GlobalStatus {
                size: waiting.len(),
                pending: active.len(),
                concurrency,
            },
            waiting,
            active,
            estimated_wait: per_task * rounds,
        }
    }

    pub fn update_config(&self, updated: SchedulerConfig) {
        let mut cfg = self.config.lock();
        if updated.global_limit < cfg.global_limit {
            warn!(
                target: "scheduler",
                old = cfg.global_limit,
                new = updated.global_limit,
                "shrinking global limit; in-flight tasks keep their slots"
            );
        }
        *cfg = updated;
        drop(cfg);
        self.notify.notify_one();
    }
}
