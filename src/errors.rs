//! # Error Types
//!
//! Crate-wide error taxonomy for the lock, cache, scheduler and degradation subsystems.
//!
//! Infrastructure faults (`BackendUnavailable`) are normally recovered inside the subsystem
//! that hit them and only reach callers once a retry or quorum budget is exhausted. Logical
//! faults (`HandlerError`, `ConfigInvalid`) always carry the original message verbatim.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::kv::KvError;

/// Errors surfaced by the resilience layer
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// A key-value instance could not be reached or answered with an error
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Lock acquisition could not reach a majority of instances within the lease budget
    #[error("Quorum not met for lock '{resource}': acquired {acquired} of required {required}")]
    QuorumNotMet {
        resource: String,
        acquired: usize,
        required: usize,
    },

    /// The scheduler queue is at capacity
    #[error("Task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// A task handler returned an error
    #[error("Handler for task {task_id} ({task_type}) failed: {message}")]
    HandlerError {
        task_id: Uuid,
        task_type: String,
        message: String,
    },

    /// No handler is registered for a task type
    #[error("No handler registered for task type '{0}'")]
    HandlerNotFound(String),

    /// A task id is already tracked by the scheduler
    #[error("Task {0} already exists")]
    DuplicateTask(Uuid),

    /// A task id is not tracked by the scheduler
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    /// Renewal fell below quorum and the lock is no longer held
    #[error("Lock '{resource}' lost")]
    LockLost { resource: String },

    /// A configuration value was rejected; the previous configuration stays active
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No service is registered under the given name
    #[error("Service '{0}' is not registered")]
    ServiceNotFound(String),

    /// A service is degraded and has no fallback implementation
    #[error("Service '{0}' is degraded and has no fallback")]
    ServiceUnavailable(String),

    /// A service implementation returned an error
    #[error("Service '{service}' failed: {message}")]
    ServiceFailed { service: String, message: String },

    /// A cache fill function returned an error
    #[error("Cache fill for '{key}' failed: {message}")]
    FallbackFailed { key: String, message: String },

    /// The component has been closed
    #[error("{0} is shutting down")]
    ShuttingDown(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type used throughout the crate
pub type ResilienceResult<T> = Result<T, ResilienceError>;

impl ResilienceError {
    /// Whether the error came from infrastructure rather than caller logic
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::QuorumNotMet { .. } | Self::QueueFull { .. }
        )
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<ConfigurationError> for ResilienceError {
    fn from(err: ConfigurationError) -> Self {
        Self::ConfigInvalid(err.to_string())
    }
}

impl From<KvError> for ResilienceError {
    fn from(err: KvError) -> Self {
        let (backend, reason) = err.parts();
        Self::BackendUnavailable {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = ResilienceError::QuorumNotMet {
            resource: "orders".to_string(),
            acquired: 1,
            required: 2,
        };
        assert!(err.is_transient());
        assert!(!ResilienceError::ConfigInvalid("bad".to_string()).is_transient());
    }

    #[test]
    fn test_kv_error_conversion_keeps_backend_name() {
        let err: ResilienceError = KvError::Timeout {
            backend: "kv-1".to_string(),
            message: "PING timed out".to_string(),
        }
        .into();
        match err {
            ResilienceError::BackendUnavailable { backend, reason } => {
                assert_eq!(backend, "kv-1");
                assert!(reason.contains("PING"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_display_messages() {
        let err = ResilienceError::QueueFull { capacity: 10 };
        assert_eq!(err.to_string(), "Task queue is full (capacity 10)");
    }
}
