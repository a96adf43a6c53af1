//! Key-value backend error types

use thiserror::Error;

/// Errors that can occur while talking to a key-value instance
#[derive(Debug, Clone, Error)]
pub enum KvError {
    /// Failed to establish a connection
    #[error("KV connection error on '{backend}': {message}")]
    Connection { backend: String, message: String },

    /// The instance did not answer within the command timeout
    #[error("KV operation timed out on '{backend}': {message}")]
    Timeout { backend: String, message: String },

    /// The instance answered with an error
    #[error("KV backend error on '{backend}': {message}")]
    Backend { backend: String, message: String },

    /// The instance is marked unavailable
    #[error("KV backend '{backend}' unavailable: {message}")]
    Unavailable { backend: String, message: String },
}

/// Result type for key-value operations
pub type KvResult<T> = Result<T, KvError>;

impl KvError {
    pub fn connection(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Timeout {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn backend(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Backend name and message
    pub fn parts(&self) -> (&str, &str) {
        match self {
            Self::Connection { backend, message }
            | Self::Timeout { backend, message }
            | Self::Backend { backend, message }
            | Self::Unavailable { backend, message } => (backend, message),
        }
    }
}
