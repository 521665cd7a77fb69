use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepwright_core_types::{RunContext, TaskId, TenantId};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Lower weight runs first.
    pub fn weight(self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Medium => 5,
            Priority::Low => 10,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    SingleTest,
    SuiteMember,
}

/// Unit of schedulable work. Identity, tenant and priority are fixed at
/// construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    tenant_id: TenantId,
    kind: TaskKind,
    priority: Priority,
    payload: RunContext,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(tenant_id: impl Into<TenantId>, priority: Priority, payload: RunContext) -> Self {
        Self {
            id: TaskId::new(),
            tenant_id: tenant_id.into(),
            kind: TaskKind::SingleTest,
            priority,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &RunContext {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            kind: self.kind,
            priority: self.priority,
            run_id: self.payload.run_id.to_string(),
            created_at: self.created_at,
        }
    }
}

/// Lightweight view of a task used by events and queue listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

/// Handed to the executor on every attempt.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub attempt: u32,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub attempts: u32,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Active,
    Absent,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStatus {
    /// Tasks waiting for a slot.
    pub size: usize,
    /// Tasks currently executing.
    pub pending: usize,
    pub concurrency: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub global: GlobalStatus,
    pub waiting: Vec<TaskSummary>,
    pub active: Vec<TaskSummary>,
    pub estimated_wait: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub global_limit: usize,
    pub per_tenant_limit: usize,
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    pub retry_attempts: u32,
    #[serde(with = "duration_ms", default = "default_backoff")]
    pub retry_backoff: Duration,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_limit: 5,
            per_tenant_limit: 2,
            task_timeout: Duration::from_secs(600),
            retry_attempts: 1,
            retry_backoff: default_backoff(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_event_buffer() -> usize {
    256
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
