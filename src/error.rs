use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Why raw model output could not become an action or plan.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("malformed model output: {reason}")]
    Malformed { reason: String },

    #[error("unknown action `{name}`")]
    UnknownAction { name: String },

    #[error("action `{action}` is missing field `{field}`")]
    MissingField { action: String, field: String },
}

impl ValidationError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ValidationError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Category of a failed action, carried inside [`crate::ExecutionOutcome::Err`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The provider rejected the call (element missing, script error, ...).
    ProviderFault,
    /// The provider handle is gone; further actions cannot succeed.
    ProviderUnavailable,
    Timeout,
    /// No handler is registered for the action's kind.
    Unhandled,
}

/// Faults a capability provider reports back to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderFault {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderFault {
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            ProviderFault::ElementNotFound(_) | ProviderFault::Other(_) => {
                ExecutionErrorKind::ProviderFault
            }
            ProviderFault::Timeout(_) => ExecutionErrorKind::Timeout,
            ProviderFault::Unavailable(_) => ExecutionErrorKind::ProviderUnavailable,
        }
    }
}

/// Failures of the inference service. An empty completion is not an error.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("cannot reach inference service: {0}")]
    Unavailable(String),

    #[error("inference request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("inference service returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unreadable inference response: {0}")]
    Decode(String),
}

/// Conditions that end a controller run early.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerError {
    #[error("inference service unavailable: {message}")]
    InferenceUnavailable { message: String },

    #[error("inference timed out after {timeout_secs}s")]
    InferenceTimeout { timeout_secs: u64 },

    #[error("capability provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    #[error("could not read the current state: {message}")]
    SnapshotFailed {
        #[serde(rename = "error_kind")]
        kind: ExecutionErrorKind,
        message: String,
    },
}

impl ControllerError {
    /// Sort a snapshot fault: only a lost provider is reported as
    /// unavailable, every other fault keeps its own kind.
    pub fn from_snapshot_fault(fault: ProviderFault) -> Self {
        match fault {
            ProviderFault::Unavailable(message) => ControllerError::ProviderUnavailable { message },
            other => ControllerError::SnapshotFailed {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

impl From<InferenceError> for ControllerError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Timeout(after) => ControllerError::InferenceTimeout {
                timeout_secs: after.as_secs(),
            },
            other => ControllerError::InferenceUnavailable {
                message: other.to_string(),
            },
        }
    }
}
