pub mod adapter;
pub mod errors;
pub mod executor;
pub mod model;
pub mod registry;
pub mod service;

pub use adapter::{BrowserDriver, DriverError, DriverErrorKind, DriverFactory, DriverOutcome, SharedDriver};
pub use errors::RunError;
pub use executor::RunExecutor;
pub use model::{RunLogEntry, RunLogLevel, RunStatus, RunSummary, Step, StepOutcome, TestRun};
pub use registry::RunRegistry;
pub use service::{RunHandle, RunRequest, TestRunService};
