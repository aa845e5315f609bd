//! Error types for the crew runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type for the crew.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Task graph error: {0}")]
    Graph(#[from] GraphError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Completion backend errors.
///
/// Transport failures, non-2xx statuses and undecodable envelopes are kept
/// apart so callers can tell an unreachable backend from a confused one.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    HttpStatus {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl LlmError {
    /// Whether the failure is on the transport side (retryable).
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, Self::InvalidResponse { .. })
    }
}

/// Tool registry and tool execution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid input for tool {name}: {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} is not permitted for worker {worker}")]
    NotPermitted { name: String, worker: String },

    #[error("Tool {name} has an invalid input schema: {reason}")]
    InvalidSchema { name: String, reason: String },
}

/// Errors raised while a worker turns a query into structured output.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Backend unavailable for worker {worker}: {reason}")]
    BackendUnavailable { worker: String, reason: String },

    #[error("Malformed output from worker {worker}: {reason}")]
    MalformedOutput { worker: String, reason: String },

    #[error("Worker {worker} tool {tool} failed: {source}")]
    Tool {
        worker: String,
        tool: String,
        #[source]
        source: ToolError,
    },
}

/// Human checkpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint {id} not found")]
    NotFound { id: Uuid },

    #[error("Checkpoint for task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("Checkpoint {id} was withdrawn before a decision arrived")]
    Withdrawn { id: Uuid },
}

/// Task graph construction errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Task {task_id} is bound to unknown worker {worker}")]
    UnknownWorker { task_id: String, worker: String },

    #[error("Task {task_id} depends on unknown or later task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Duplicate task id {0}")]
    DuplicateTask(String),

    #[error("Duplicate worker name {0}")]
    DuplicateWorker(String),
}

/// Normalized error kind recorded on a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BackendUnavailable,
    MalformedOutput,
    ToolNotFound,
    InvalidToolInput,
    ToolTimeout,
    ToolFailed,
    ToolNotPermitted,
    ClassificationFailed,
    UnknownDelegate,
    DependencyFailed,
    CheckpointRejected,
    CheckpointTimeout,
    RunAborted,
    RunCancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// The user-visible failure attached to a task result: the normalized kind
/// plus the original diagnostic string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::ToolNotFound,
            Self::InvalidInput { .. } | Self::InvalidSchema { .. } => ErrorKind::InvalidToolInput,
            Self::Timeout { .. } => ErrorKind::ToolTimeout,
            Self::ExecutionFailed { .. } => ErrorKind::ToolFailed,
            Self::NotPermitted { .. } => ErrorKind::ToolNotPermitted,
        }
    }
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::MalformedOutput { .. } => ErrorKind::MalformedOutput,
            Self::Tool { source, .. } => source.kind(),
        }
    }

    /// Only transport-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

impl From<&WorkerError> for TaskError {
    fn from(err: &WorkerError) -> Self {
        TaskError::new(err.kind(), err.to_string())
    }
}

impl From<&CheckpointError> for TaskError {
    fn from(err: &CheckpointError) -> Self {
        let kind = match err {
            CheckpointError::Timeout { .. } => ErrorKind::CheckpointTimeout,
            CheckpointError::NotFound { .. } | CheckpointError::Withdrawn { .. } => {
                ErrorKind::RunCancelled
            }
        };
        TaskError::new(kind, err.to_string())
    }
}

/// Result type alias for the crew.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_errors_map_to_kinds() {
        let err = ToolError::Timeout {
            name: "kubectl".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), ErrorKind::ToolTimeout);
        assert_eq!(
            ToolError::NotFound { name: "x".into() }.kind(),
            ErrorKind::ToolNotFound
        );
    }

    #[test]
    fn worker_tool_error_keeps_tool_kind_and_name() {
        let err = WorkerError::Tool {
            worker: "DevAgent".into(),
            tool: "yaml_validator".into(),
            source: ToolError::InvalidInput {
                name: "yaml_validator".into(),
                reason: "missing yaml_content".into(),
            },
        };
        let task_err = TaskError::from(&err);
        assert_eq!(task_err.kind, ErrorKind::InvalidToolInput);
        assert!(task_err.message.contains("yaml_validator"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_kind_serializes_as_tag() {
        let json = serde_json::to_string(&ErrorKind::RunCancelled).unwrap();
        assert_eq!(json, "\"RunCancelled\"");
    }

    #[test]
    fn llm_invalid_response_is_not_unavailable() {
        let err = LlmError::InvalidResponse {
            provider: "ollama".into(),
            reason: "bad envelope".into(),
        };
        assert!(!err.is_unavailable());
        let err = LlmError::HttpStatus {
            provider: "ollama".into(),
            status: 503,
            body: String::new(),
        };
        assert!(err.is_unavailable());
    }
}
