use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use stepwright_core_types::{Command, RunContext, RunId};
use tracing::debug;

use crate::errors::RunError;
use crate::model::{RunLogEntry, RunLogLevel, RunStatus, Step, StepOutcome, TestRun};

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug)]
struct RunRecord {
    run: TestRun,
    logs: VecDeque<RunLogEntry>,
    next_cursor: u64,
}

impl RunRecord {
    fn snapshot(&self) -> TestRun {
        let mut run = self.run.clone();
        run.logs = self.logs.iter().cloned().collect();
        run
    }
}

/// Shared state of every run this process knows about.
///
/// Status only moves forward, step outcomes are written once and the log is
/// append-only. Once more than `log_capacity` entries exist the oldest are
/// dropped from view; cursors stay monotonic so readers can spot the gap.
pub struct RunRegistry {
    records: DashMap<RunId, Mutex<RunRecord>>,
    log_capacity: usize,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn register(&self, ctx: &RunContext) -> Result<TestRun, RunError> {
        let run = TestRun {
            run_id: ctx.run_id.clone(),
            test_case_id: ctx.test_case_id.clone(),
            status: RunStatus::Queued,
            steps: ctx
                .steps
                .iter()
                .enumerate()
                .map(|(order, desc)| Step::new(order, desc.as_str()))
                .collect(),
            logs: Vec::new(),
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
        };
        match self.records.entry(ctx.run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RunError::Duplicate(ctx.run_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Mutex::new(RunRecord {
                    run: run.clone(),
                    logs: VecDeque::new(),
                    next_cursor: 0,
                }));
                Ok(run)
            }
        }
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.records.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, run_id: &RunId) -> Option<TestRun> {
        self.records
            .get(run_id)
            .map(|record| record.lock().snapshot())
    }

    pub fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.records.get(run_id).map(|record| record.lock().run.status)
    }

    pub fn list(&self) -> Vec<TestRun> {
        let mut runs: Vec<TestRun> = self
            .records
            .iter()
            .map(|entry| entry.value().lock().snapshot())
            .collect();
        runs.sort_by_key(|run| run.queued_at);
        runs
    }

    /// Move the run to `next`. `error` is recorded only when failing.
    pub fn transition(
        &self,
        run_id: &RunId,
        next: RunStatus,
        error: Option<String>,
    ) -> Result<(), RunError> {
        self.with_record(run_id, |record| {
            let current = record.run.status;
            if !current.can_transition_to(next) {
                return Err(RunError::InvalidTransition {
                    run_id: run_id.clone(),
                    from: current,
                    to: next,
                });
            }
            let now = Utc::now();
            record.run.status = next;
            if next == RunStatus::Running {
                record.run.started_at = Some(now);
            }
            if next.is_terminal() {
                record.run.ended_at = Some(now);
            }
            if next == RunStatus::Failed {
                record.run.error = error;
            }
            debug!(target: "run_executor", run = %run_id, from = %current, to = %next, "run transition");
            Ok(())
        })
    }

    pub fn begin_attempt(
        &self,
        run_id: &RunId,
        order: usize,
        command: Command,
    ) -> Result<u32, RunError> {
        self.with_step(run_id, order, |step| {
            step.attempts += 1;
            step.resolved_command = Some(command);
            Ok(step.attempts)
        })
    }

    /// Note a failed resolution; the step is attempted but has no command.
    pub fn count_attempt(&self, run_id: &RunId, order: usize) -> Result<u32, RunError> {
        self.with_step(run_id, order, |step| {
            step.attempts += 1;
            Ok(step.attempts)
        })
    }

    pub fn finish_step(
        &self,
        run_id: &RunId,
        order: usize,
        outcome: StepOutcome,
        error: Option<String>,
    ) -> Result<(), RunError> {
        self.with_step(run_id, order, |step| {
            step.outcome = outcome;
            step.error = error;
            Ok(())
        })
    }

    /// Mark every step still pending as skipped. Returns how many changed.
    pub fn skip_pending(&self, run_id: &RunId) -> Result<usize, RunError> {
        self.with_record(run_id, |record| {
            let mut skipped = 0;
            for step in record
                .run
                .steps
                .iter_mut()
                .filter(|step| step.outcome == StepOutcome::Pending)
            {
                step.outcome = StepOutcome::Skipped;
                skipped += 1;
            }
            Ok(skipped)
        })
    }

    pub fn step(&self, run_id: &RunId, order: usize) -> Option<Step> {
        self.records
            .get(run_id)
            .and_then(|record| record.lock().run.steps.get(order).cloned())
    }

    pub fn push_log(
        &self,
        run_id: &RunId,
        level: RunLogLevel,
        step: Option<usize>,
        message: impl Into<String>,
    ) -> Option<u64> {
        let entry = self.records.get(run_id)?;
        let mut record = entry.lock();
        let cursor = record.next_cursor;
        record.next_cursor = record.next_cursor.wrapping_add(1);
        record.logs.push_back(RunLogEntry {
            cursor,
            timestamp: Utc::now(),
            level,
            step,
            message: message.into(),
        });
        while record.logs.len() > self.log_capacity {
            record.logs.pop_front();
        }
        Some(cursor)
    }

    /// Entries with `cursor` strictly greater than `after`, or newer than
    /// `since`, oldest first.
    pub fn logs_since(
        &self,
        run_id: &RunId,
        after: Option<u64>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Option<Vec<RunLogEntry>> {
        let entry = self.records.get(run_id)?;
        let record = entry.lock();
        let iter = record
            .logs
            .iter()
            .filter(|log| after.map_or(true, |cursor| log.cursor > cursor))
            .filter(|log| since.map_or(true, |ts| log.timestamp > ts))
            .cloned();
        Some(match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    pub fn remove(&self, run_id: &RunId) -> Option<TestRun> {
        self.records
            .remove(run_id)
            .map(|(_, record)| record.into_inner().snapshot())
    }

    fn with_record<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunRecord) -> Result<T, RunError>,
    ) -> Result<T, RunError> {
        let entry = self
            .records
            .get(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.clone()))?;
        let mut record = entry.lock();
        f(&mut record)
    }

    fn with_step<T>(
        &self,
        run_id: &RunId,
        order: usize,
        f: impl FnOnce(&mut Step) -> Result<T, RunError>,
    ) -> Result<T, RunError> {
        self.with_record(run_id, |record| {
            let step = record
                .run
                .steps
                .get_mut(order)
                .ok_or_else(|| RunError::UnknownStep {
                    run_id: run_id.clone(),
                    order,
                })?;
            if step.outcome.is_final() {
                return Err(RunError::StepFinished {
                    run_id: run_id.clone(),
                    order,
                });
            }
            f(step)
        })
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}
