//! Error types for sqlrun services

use std::fmt;

/// Result type alias using SqlRunError
pub type Result<T> = std::result::Result<T, SqlRunError>;

/// Main error type shared by the coordinator and the worker.
///
/// Cloneable so a single failure (for example a failed session creation)
/// can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlRunError {
    /// Worker failed to spawn, exited before READY, or CONNECT failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Worker process exited while a command was outstanding
    #[error("Worker process exited: {0}")]
    WorkerExited(String),

    /// Session was deliberately killed (cancel/close)
    #[error("Session terminated; temporary state for this file was discarded")]
    SessionTerminated,

    /// Query was dropped from the queue before it started
    #[error("Query was cancelled")]
    QueryCancelled,

    /// Session has statements queued or running
    #[error("Session is busy: {0}")]
    Busy(String),

    /// Global open-session ceiling reached
    #[error("Too many open sessions (limit {max}); close a file to free a session")]
    Capacity { max: usize },

    /// Worker replied with an ERROR event instead of the expected result
    #[error("Worker error: {0}")]
    Worker(String),

    /// Malformed or unexpected protocol traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error talking to the worker
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unknown run or session
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SqlRunError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        SqlRunError::Internal(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            SqlRunError::Connection(_) => "CONNECTION_ERROR",
            SqlRunError::WorkerExited(_) => "WORKER_EXITED",
            SqlRunError::SessionTerminated => "SESSION_TERMINATED",
            SqlRunError::QueryCancelled => "QUERY_CANCELLED",
            SqlRunError::Busy(_) => "SESSION_BUSY",
            SqlRunError::Capacity { .. } => "CAPACITY_EXCEEDED",
            SqlRunError::Worker(_) => "WORKER_ERROR",
            SqlRunError::Protocol(_) => "PROTOCOL_ERROR",
            SqlRunError::Config(_) => "CONFIG_ERROR",
            SqlRunError::Io(_) => "IO_ERROR",
            SqlRunError::Serialization(_) => "SERIALIZATION_ERROR",
            SqlRunError::NotFound(_) => "NOT_FOUND",
            SqlRunError::Internal(_) => "INTERNAL",
        }
    }

    /// True when the error means the owning session can no longer be used
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SqlRunError::WorkerExited(_) | SqlRunError::SessionTerminated | SqlRunError::Io(_)
        )
    }
}

impl From<serde_json::Error> for SqlRunError {
    fn from(err: serde_json::Error) -> Self {
        SqlRunError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SqlRunError {
    fn from(err: std::io::Error) -> Self {
        SqlRunError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for SqlRunError {
    fn from(err: config::ConfigError) -> Self {
        SqlRunError::Config(err.to_string())
    }
}
