pub mod api;
pub mod error;
pub mod events;
pub mod executor;
pub mod lane;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod runtime;

pub use api::{Scheduler, SchedulerService, TaskHandle};
pub use error::SchedulerError;
pub use events::TaskEvent;
pub use executor::{FnExecutor, NoopExecutor, TaskExecutor};
pub use metrics::SchedulerMetricsSnapshot;
pub use model::{
    GlobalStatus, Priority, QueueStatus, SchedulerConfig, Task, TaskContext, TaskKind, TaskOutput,
    TaskState, TaskSummary,
};
