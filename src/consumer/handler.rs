//! Handler trait and per-handler outcome tracking

use async_trait::async_trait;
use thiserror::Error;

use crate::messaging::EventEnvelope;

/// Error returned by a failing event handler
#[derive(Debug, Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Processes one event type.
///
/// Handlers must be idempotent: delivery is at-least-once, so the same
/// envelope may arrive more than once after crashes or timeouts.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;

    /// Stable name used in logs and duplicate-registration checks
    fn name(&self) -> &str {
        "unnamed_handler"
    }
}

/// Result of invoking a single handler against one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    Failed(String),
    TimedOut,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success)
    }
}
