use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepwright_core_types::{Command, RunId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Transitions only move forward; terminal states are final.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Completed)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    #[default]
    Pending,
    Success,
    Failure,
    Skipped,
}

impl StepOutcome {
    pub fn is_final(self) -> bool {
        self != StepOutcome::Pending
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub order: usize,
    pub description: String,
    /// Set once per execution attempt, from the cache or the resolver.
    pub resolved_command: Option<Command>,
    pub outcome: StepOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn new(order: usize, description: impl Into<String>) -> Self {
        Self {
            order,
            description: description.into(),
            resolved_command: None,
            outcome: StepOutcome::Pending,
            attempts: 0,
            error: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub cursor: u64,
    pub timestamp: DateTime<Utc>,
    pub level: RunLogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: RunId,
    pub test_case_id: String,
    pub status: RunStatus,
    pub steps: Vec<Step>,
    pub logs: Vec<RunLogEntry>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// First fatal cause; set only for `failed` runs.
    pub error: Option<String>,
}

impl TestRun {
    pub fn summary(&self) -> RunSummary {
        let count = |outcome: StepOutcome| self.steps.iter().filter(|s| s.outcome == outcome).count();
        RunSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            total_steps: self.steps.len(),
            succeeded: count(StepOutcome::Success),
            failed: count(StepOutcome::Failure),
            skipped: count(StepOutcome::Skipped),
            error: self.error.clone(),
        }
    }
}

/// Compact run result handed back through the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total_steps: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub error: Option<String>,
}
