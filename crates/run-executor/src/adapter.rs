use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stepwright_core_types::{Command, CoreError, ErrorKind, PageState, RunContext};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    Timeout,
    DetachedElement,
    Other,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    pub fn detached(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::DetachedElement, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, message)
    }

    /// Worth exactly one more try at the step level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DriverErrorKind::Timeout | DriverErrorKind::DetachedElement
        )
    }
}

impl From<DriverError> for CoreError {
    fn from(value: DriverError) -> Self {
        let kind = if value.is_transient() {
            ErrorKind::TransientStep
        } else {
            ErrorKind::FatalStep
        };
        CoreError::new(kind, value.message)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverOutcome {
    pub result: serde_json::Value,
    /// Page state after the command ran.
    pub page: PageState,
}

/// One remote browser session. No implicit retries.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn current_page(&self) -> Result<PageState, DriverError>;
    async fn execute(&self, command: &Command) -> Result<DriverOutcome, DriverError>;

    async fn close(&self) {}
}

/// Opens a driver session for a run.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self, run: &RunContext) -> Result<Arc<dyn BrowserDriver>, DriverError>;
}

/// Hands every run the same session.
#[derive(Clone)]
pub struct SharedDriver(pub Arc<dyn BrowserDriver>);

#[async_trait]
impl DriverFactory for SharedDriver {
    async fn open(&self, _run: &RunContext) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        Ok(Arc::clone(&self.0))
    }
}
