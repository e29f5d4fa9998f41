//! # PostgreSQL Queue Backend (pgmq)
//!
//! Durable `EventQueue` implementation on top of the pgmq extension. pgmq
//! gives us everything the delivery contract needs natively: per-read
//! visibility timeouts, a `read_ct` delivery counter, and an archive table
//! for messages pulled out of rotation.

use async_trait::async_trait;
use chrono::Utc;
use pgmq::PGMQueue;
use std::time::Duration;
use tracing::debug;

use super::errors::{MessagingError, MessagingResult};
use super::queue::{EventQueue, QueueMessage};

/// pgmq-backed event queue
#[derive(Debug, Clone)]
pub struct PgmqQueue {
    pgmq: PGMQueue,
}

impl PgmqQueue {
    /// Connect using a database URL
    pub async fn new(database_url: &str) -> MessagingResult<Self> {
        let pgmq = PGMQueue::new(database_url.to_string())
            .await
            .map_err(|e| MessagingError::DatabaseConnection(e.to_string()))?;
        debug!("pgmq event queue connected");
        Ok(Self { pgmq })
    }

    /// Create using an existing connection pool (BYOP)
    pub async fn new_with_pool(pool: sqlx::PgPool) -> Self {
        let pgmq = PGMQueue::new_with_pool(pool).await;
        Self { pgmq }
    }

    fn op_error(
        queue_name: &str,
        operation: &str,
        error: impl std::fmt::Display,
    ) -> MessagingError {
        MessagingError::queue_operation(queue_name, operation, error.to_string())
    }
}

#[async_trait]
impl EventQueue for PgmqQueue {
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()> {
        // pgmq.create is CREATE IF NOT EXISTS under the hood
        self.pgmq
            .create(queue_name)
            .await
            .map_err(|e| Self::op_error(queue_name, "create", e))?;
        debug!(queue_name = queue_name, "Queue ready");
        Ok(())
    }

    async fn send(&self, queue_name: &str, payload: &serde_json::Value) -> MessagingResult<i64> {
        self.pgmq
            .send(queue_name, payload)
            .await
            .map_err(|e| Self::op_error(queue_name, "send", e))
    }

    async fn read(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueueMessage>> {
        let vt_seconds = visibility_timeout.as_secs().max(1) as i32;
        let messages: Vec<pgmq::types::Message<serde_json::Value>> = self
            .pgmq
            .read_batch(queue_name, Some(vt_seconds), limit as i32)
            .await
            .map_err(|e| Self::op_error(queue_name, "read", e))?
            .unwrap_or_default();

        Ok(messages
            .into_iter()
            .map(|m| QueueMessage {
                msg_id: m.msg_id,
                read_ct: m.read_ct.max(0) as u32,
                payload: m.message,
                enqueued_at: m.enqueued_at,
            })
            .collect())
    }

    async fn ack(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        self.pgmq
            .delete(queue_name, msg_id)
            .await
            .map_err(|e| Self::op_error(queue_name, "ack", e))?;
        Ok(())
    }

    async fn nak(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        // Collapse the remaining lease so the message is redelivered now
        self.pgmq
            .set_vt::<serde_json::Value>(queue_name, msg_id, Utc::now())
            .await
            .map_err(|e| Self::op_error(queue_name, "nak", e))?;
        Ok(())
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        self.pgmq
            .archive(queue_name, msg_id)
            .await
            .map_err(|e| Self::op_error(queue_name, "archive", e))?;
        Ok(())
    }

    async fn queue_depth(&self, queue_name: &str) -> MessagingResult<i64> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
                .bind(queue_name)
                .fetch_one(&self.pgmq.connection)
                .await?;
        Ok(row.0.unwrap_or(0))
    }
}
