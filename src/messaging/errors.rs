//! Error types for queue operations

use thiserror::Error;

/// Errors raised by event queue backends
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Queue operation failed on '{queue_name}' during {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Failed to serialize message: {0}")]
    MessageSerialization(String),

    #[error("Failed to deserialize message: {0}")]
    MessageDeserialization(String),

    #[error("Database connection error: {0}")]
    DatabaseConnection(String),

    #[error("Operation '{operation}' timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Internal messaging error: {0}")]
    Internal(String),
}

impl MessagingError {
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(error: serde_json::Error) -> Self {
        Self::MessageSerialization(error.to_string())
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(error: sqlx::Error) -> Self {
        Self::DatabaseConnection(error.to_string())
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
