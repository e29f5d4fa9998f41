//! In-memory queue backend with visibility-timeout semantics.
//!
//! Mirrors the durable backend's delivery behavior closely enough that
//! consumer redelivery and poison handling can be tested without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use super::errors::{MessagingError, MessagingResult};
use super::queue::{EventQueue, QueueMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
    /// `None` when never leased; otherwise the instant the lease lapses
    visible_at: Option<DateTime<Utc>>,
    read_ct: u32,
}

impl StoredMessage {
    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    next_id: i64,
}

/// In-memory `EventQueue` implementation
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unknown_queue(queue_name: &str, operation: &str) -> MessagingError {
    MessagingError::queue_operation(queue_name, operation, "queue does not exist")
}

#[async_trait]
impl EventQueue for InMemoryQueue {
    async fn create_queue(&self, queue_name: &str) -> MessagingResult<()> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue_name.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue_name: &str, payload: &serde_json::Value) -> MessagingResult<i64> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| unknown_queue(queue_name, "send"))?;

        state.next_id += 1;
        let id = state.next_id;
        state.messages.push_back(StoredMessage {
            id,
            payload: payload.clone(),
            enqueued_at: Utc::now(),
            visible_at: None,
            read_ct: 0,
        });
        Ok(id)
    }

    async fn read(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueueMessage>> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| unknown_queue(queue_name, "read"))?;

        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| MessagingError::internal(e.to_string()))?;

        let mut leased = Vec::new();
        for message in state.messages.iter_mut() {
            if leased.len() >= limit {
                break;
            }
            if message.is_visible(now) {
                message.read_ct += 1;
                message.visible_at = Some(lease_until);
                leased.push(QueueMessage {
                    msg_id: message.id,
                    read_ct: message.read_ct,
                    payload: message.payload.clone(),
                    enqueued_at: message.enqueued_at,
                });
            }
        }
        Ok(leased)
    }

    async fn ack(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| unknown_queue(queue_name, "ack"))?;
        state.messages.retain(|m| m.id != msg_id);
        Ok(())
    }

    async fn nak(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue_name)
            .ok_or_else(|| unknown_queue(queue_name, "nak"))?;
        if let Some(message) = state.messages.iter_mut().find(|m| m.id == msg_id) {
            message.visible_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        // No archive table in memory; removal matches the visible effect
        self.ack(queue_name, msg_id).await
    }

    async fn queue_depth(&self, queue_name: &str) -> MessagingResult<i64> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue_name)
            .ok_or_else(|| unknown_queue(queue_name, "queue_depth"))?;
        Ok(state.messages.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_requires_existing_queue() {
        let queue = InMemoryQueue::new();
        assert!(queue.send("missing", &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_leased_message_is_invisible_until_timeout() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q").await.unwrap();
        queue.send("q", &json!({"n": 1})).await.unwrap();

        let first = queue
            .read("q", Duration::from_millis(50), 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].read_ct, 1);

        // Still leased
        let second = queue
            .read("q", Duration::from_millis(50), 10)
            .await
            .unwrap();
        assert!(second.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let third = queue
            .read("q", Duration::from_millis(50), 10)
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].read_ct, 2);
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q").await.unwrap();
        let id = queue.send("q", &json!({"n": 1})).await.unwrap();
        queue.read("q", Duration::from_secs(30), 1).await.unwrap();

        queue.ack("q", id).await.unwrap();
        assert_eq!(queue.queue_depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nak_makes_message_immediately_visible() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q").await.unwrap();
        let id = queue.send("q", &json!({"n": 1})).await.unwrap();
        queue.read("q", Duration::from_secs(30), 1).await.unwrap();

        queue.nak("q", id).await.unwrap();
        let redelivered = queue.read("q", Duration::from_secs(30), 1).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].read_ct, 2);
    }

    #[tokio::test]
    async fn test_read_respects_limit_and_order() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q").await.unwrap();
        for n in 0..5 {
            queue.send("q", &json!({"n": n})).await.unwrap();
        }

        let batch = queue.read("q", Duration::from_secs(30), 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].payload["n"], 0);
        assert_eq!(batch[2].payload["n"], 2);
    }

    #[tokio::test]
    async fn test_create_queue_is_idempotent() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q").await.unwrap();
        queue.send("q", &json!({})).await.unwrap();
        queue.create_queue("q").await.unwrap();
        assert_eq!(queue.queue_depth("q").await.unwrap(), 1);
    }
}
