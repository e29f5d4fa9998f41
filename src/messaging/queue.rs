//! Queue abstraction for durable event delivery.
//!
//! At-least-once semantics: a read makes the message invisible for the
//! visibility timeout; an explicit ack removes it, a nak makes it immediately
//! visible again, and an unacked message reappears on its own once the
//! timeout lapses. `read_ct` counts deliveries so consumers can fence
//! poison messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::errors::MessagingResult;

/// A message leased from a queue
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Backend-assigned message id, unique per queue
    pub msg_id: i64,
    /// Number of times this message has been delivered, including this one
    pub read_ct: u32,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Deliveries before this one
    pub fn prior_deliveries(&self) -> u32 {
        self.read_ct.saturating_sub(1)
    }
}

/// Durable event queue backend
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Create the queue if it does not exist; idempotent
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()>;

    /// Append a message; returns the backend message id
    async fn send(&self, queue_name: &str, payload: &serde_json::Value) -> MessagingResult<i64>;

    /// Lease up to `limit` visible messages, hiding each for
    /// `visibility_timeout`
    async fn read(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueueMessage>>;

    /// Acknowledge successful processing; the message is removed
    async fn ack(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()>;

    /// Negative-acknowledge; the message becomes visible again immediately
    async fn nak(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()>;

    /// Move a message to the archive instead of deleting it
    async fn archive(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()>;

    /// Number of messages currently in the queue, visible or not
    async fn queue_depth(&self, queue_name: &str) -> MessagingResult<i64>;
}
