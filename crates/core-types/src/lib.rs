use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Classification carried by every error that crosses a crate boundary.
///
/// Callers branch on the kind, never on the rendered message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The AI resolver could not produce a usable command.
    Resolution,
    /// Adapter timeout or detached element; worth one more try.
    TransientStep,
    /// Any other adapter failure; ends the run.
    FatalStep,
    /// A task overran its wall-clock budget.
    TaskTimeout,
    /// A cancellation flag was observed.
    Cancelled,
    /// Durable store failure.
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::TransientStep => "transient_step",
            ErrorKind::FatalStep => "fatal_step",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged error shared by the scheduler, cache and run executor.
#[derive(Clone, Debug, Error, Eq, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(TaskId);
string_id!(RunId);
string_id!(TenantId);

/// Structured, adapter-executable form of a natural-language step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Command {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args)
    }
}

/// Stable digest of the interactive page state.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageFingerprint(pub String);

impl PageFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageFingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Page state reported by the browser driver after each command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub fingerprint: PageFingerprint,
    #[serde(default)]
    pub url: Option<String>,
    /// Context handed to the AI resolver; never part of the cache key.
    #[serde(default)]
    pub snapshot: serde_json::Value,
}

impl PageState {
    pub fn new(fingerprint: PageFingerprint) -> Self {
        Self {
            fingerprint,
            url: None,
            snapshot: serde_json::Value::Null,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// Payload carried by a scheduled task: one test run to execute.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub test_case_id: String,
    pub steps: Vec<String>,
    /// Keep executing after a failed step; the run still ends `failed`.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl RunContext {
    pub fn new(test_case_id: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            run_id: RunId::new(),
            test_case_id: test_case_id.into(),
            steps,
            continue_on_failure: false,
        }
    }
}
