//! Error types for queue operations.
//!
//! Covers store failures surfaced to intake, handler resolution, downstream
//! task requests and configuration problems. Handler failures never leave a
//! drain cycle; they are recorded on the pending entry instead.

use hookline_core::CoreError;
use thiserror::Error;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Error conditions raised by the queue and its downstream client.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Durable store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Store error message
        message: String,
    },

    /// No handler is registered for the entry's source.
    #[error("no handler registered for source {name}")]
    HandlerNotFound {
        /// Source name that failed to resolve
        name: String,
    },

    /// Network-level failure reaching the task API.
    #[error("network error: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Task API request timed out.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// Task API answered with a non-success status.
    #[error("task request failed: {status_code} {body}")]
    TaskRejected {
        /// HTTP status code
        status_code: u16,
        /// Response body text
        body: String,
    },

    /// Invalid queue or client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },
}

impl QueueError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a handler resolution error.
    pub fn handler_not_found(name: impl Into<String>) -> Self {
        Self::HandlerNotFound { name: name.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a rejected task request error.
    pub fn task_rejected(status_code: u16, body: impl Into<String>) -> Self {
        Self::TaskRejected { status_code, body: body.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl From<CoreError> for QueueError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_rejection_message_includes_status_and_body() {
        let error = QueueError::task_rejected(502, "bad gateway");
        assert_eq!(error.to_string(), "task request failed: 502 bad gateway");
    }

    #[test]
    fn core_errors_become_storage_errors() {
        let error = QueueError::from(CoreError::Database("disk I/O error".to_string()));
        assert!(matches!(error, QueueError::Storage { .. }));
        assert!(error.to_string().contains("disk I/O error"));
    }
}
