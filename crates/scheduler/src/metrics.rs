use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-scheduler lifecycle counters.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    enqueued: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    finished_runs: AtomicU64,
    total_run_ms: AtomicU64,
}

fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SchedulerMetrics {
    pub fn record_enqueued(&self) {
        increment(&self.enqueued);
    }

    pub fn record_started(&self) {
        increment(&self.started);
    }

    pub fn record_retried(&self) {
        increment(&self.retried);
    }

    pub fn record_completed(&self, run: Duration) {
        increment(&self.completed);
        self.record_run_time(run);
    }

    pub fn record_failed(&self, run: Duration) {
        increment(&self.failed);
        self.record_run_time(run);
    }

    pub fn record_cancelled(&self) {
        increment(&self.cancelled);
    }

    fn record_run_time(&self, run: Duration) {
        increment(&self.finished_runs);
        self.total_run_ms
            .fetch_add(run.as_millis() as u64, Ordering::Relaxed);
    }

    /// Mean wall-clock time of finished tasks, if any have finished.
    pub fn average_run_time(&self) -> Option<Duration> {
        let runs = self.finished_runs.load(Ordering::Relaxed);
        if runs == 0 {
            return None;
        }
        let total = self.total_run_ms.load(Ordering::Relaxed);
        Some(Duration::from_millis(total / runs))
    }

    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerMetricsSnapshot {
    pub enqueued: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}
