//! # Task Dispatcher
//!
//! ## Overview
//!
//! Enqueues named work items onto a shared work queue and executes them on
//! worker instances. Work items are registered explicitly on a
//! [`WorkItemRegistry`] at bootstrap; dispatching a name nothing registered
//! is an error at enqueue time, not a message that dies on a worker later.
//!
//! ## Gating
//!
//! A work item may declare a [`GateSpec`]. Before running it, the worker
//! resolves the gate name template from the work arguments and acquires a
//! slot on the resulting gate. A saturated gate naks the message so another
//! attempt lands after the queue's redelivery delay, leaving the worker free
//! for other work in the meantime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{TaskStatus, TaskStatusTracker};
use crate::constants::WORK_QUEUE_NAME;
use crate::coordination::{gate_name, GateError, GateTicket, TokenGate};
use crate::messaging::{EventQueue, MessagingError, QueueMessage};

/// Error returned by a failing work item
#[derive(Debug, Error)]
#[error("Work item failed: {0}")]
pub struct WorkError(pub String);

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Concurrency gate declaration for a work item
#[derive(Debug, Clone)]
pub struct GateSpec {
    /// Gate name template, interpolated from the work arguments
    pub name_template: String,
    pub capacity: u32,
    pub max_wait: Duration,
    pub ttl: Duration,
}

/// A unit of work executable on any worker instance
#[async_trait]
pub trait WorkItem: Send + Sync {
    async fn run(&self, args: &serde_json::Value) -> Result<serde_json::Value, WorkError>;

    /// Stable name used for dispatch, registration, and status records
    fn name(&self) -> &str;

    /// Gate this work item runs behind, if any
    fn gate_spec(&self) -> Option<GateSpec> {
        None
    }
}

/// Errors from dispatch operations
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Work item '{name}' is already registered")]
    DuplicateWorkItem { name: String },

    #[error("Unknown work item: '{name}'")]
    UnknownWorkItem { name: String },

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

/// Explicit registry of dispatchable work items
#[derive(Default)]
pub struct WorkItemRegistry {
    items: HashMap<String, Arc<dyn WorkItem>>,
}

impl WorkItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, item: Arc<dyn WorkItem>) -> Result<(), DispatchError> {
        let name = item.name().to_string();
        if self.items.contains_key(&name) {
            return Err(DispatchError::DuplicateWorkItem { name });
        }
        debug!(work_item = %name, "Registered work item");
        self.items.insert(name, item);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn WorkItem>> {
        self.items.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for WorkItemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemRegistry")
            .field("items", &self.names())
            .finish()
    }
}

/// Wire format for one enqueued work item invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemMessage {
    pub work_id: String,
    pub work_name: String,
    pub args: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Returned to the dispatching caller for status polling
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub work_id: String,
    pub msg_id: i64,
}

/// Dispatcher tuning derived from the process configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub visibility_timeout: Duration,
    pub max_delivery: u32,
    pub batch_size: usize,
}

impl DispatcherConfig {
    pub fn from_fleet_config(config: &crate::config::FleetConfig) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout(),
            max_delivery: config.max_delivery,
            batch_size: config.batch_size,
        }
    }
}

/// Enqueues and executes registered work items
pub struct TaskDispatcher {
    queue: Arc<dyn EventQueue>,
    registry: Arc<WorkItemRegistry>,
    gate: Arc<TokenGate>,
    tracker: TaskStatusTracker,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        registry: Arc<WorkItemRegistry>,
        gate: Arc<TokenGate>,
        tracker: TaskStatusTracker,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            gate,
            tracker,
            config,
        }
    }

    /// Create the shared work queue; idempotent, call at bootstrap
    pub async fn ensure_queue(&self) -> crate::error::Result<()> {
        self.queue.create_queue(WORK_QUEUE_NAME).await?;
        Ok(())
    }

    /// Enqueue a work item invocation and open a status record for it.
    ///
    /// Rejects names with no registered work item so typos surface at the
    /// call site.
    pub async fn dispatch(
        &self,
        work_name: &str,
        args: serde_json::Value,
    ) -> crate::error::Result<DispatchReceipt> {
        if self.registry.get(work_name).is_none() {
            return Err(DispatchError::UnknownWorkItem {
                name: work_name.to_string(),
            }
            .into());
        }

        let work_id = Uuid::new_v4().to_string();
        self.tracker
            .create_task(&work_id, work_name, None, 0)
            .await?;

        let message = WorkItemMessage {
            work_id: work_id.clone(),
            work_name: work_name.to_string(),
            args,
            enqueued_at: Utc::now(),
        };
        let payload = serde_json::to_value(&message)
            .map_err(|e| MessagingError::MessageSerialization(e.to_string()))
            .map_err(DispatchError::from)?;
        let msg_id = self
            .queue
            .send(WORK_QUEUE_NAME, &payload)
            .await
            .map_err(DispatchError::from)?;

        info!(
            work_id = %work_id,
            work_name = work_name,
            msg_id = msg_id,
            "Work item dispatched"
        );
        Ok(DispatchReceipt { work_id, msg_id })
    }

    /// Lease one batch from the work queue and execute each item; returns
    /// the number of messages handled
    pub async fn run_worker_once(&self) -> crate::error::Result<usize> {
        let messages = self
            .queue
            .read(
                WORK_QUEUE_NAME,
                self.config.visibility_timeout,
                self.config.batch_size,
            )
            .await?;

        let count = messages.len();
        for message in messages {
            self.execute_message(message).await;
        }
        Ok(count)
    }

    async fn execute_message(&self, message: QueueMessage) {
        if message.read_ct > self.config.max_delivery {
            error!(
                msg_id = message.msg_id,
                delivery_count = message.read_ct,
                "Work item exceeded delivery ceiling; archiving"
            );
            if let Ok(work) = serde_json::from_value::<WorkItemMessage>(message.payload.clone()) {
                self.tracker
                    .mark_failed(&work.work_id, "Exceeded delivery ceiling")
                    .await;
            }
            self.archive_logged(message.msg_id).await;
            return;
        }

        let work: WorkItemMessage = match serde_json::from_value(message.payload.clone()) {
            Ok(work) => work,
            Err(e) => {
                warn!(
                    msg_id = message.msg_id,
                    delivery_count = message.read_ct,
                    error = %e,
                    "Undecodable work item message; releasing for redelivery"
                );
                self.nak_logged(message.msg_id).await;
                return;
            }
        };

        let Some(item) = self.registry.get(&work.work_name) else {
            // Registered at dispatch time but not on this worker build;
            // archiving avoids an endless redelivery loop
            error!(
                work_id = %work.work_id,
                work_name = %work.work_name,
                "No work item registered for this name; archiving"
            );
            self.tracker
                .mark_failed(&work.work_id, "No registered work item")
                .await;
            self.archive_logged(message.msg_id).await;
            return;
        };

        let ticket = match self.acquire_gate(item.as_ref(), &work).await {
            Ok(ticket) => ticket,
            Err(GateError::Saturated {
                name,
                capacity,
                waited_ms,
            }) => {
                debug!(
                    work_id = %work.work_id,
                    gate = %name,
                    capacity = capacity,
                    waited_ms = waited_ms,
                    "Gate saturated; releasing work item for retry"
                );
                self.nak_logged(message.msg_id).await;
                return;
            }
            Err(e) => {
                error!(
                    work_id = %work.work_id,
                    error = %e,
                    "Gate acquisition failed; releasing work item for retry"
                );
                self.nak_logged(message.msg_id).await;
                return;
            }
        };

        if let Err(e) = self
            .tracker
            .update_status(&work.work_id, TaskStatus::InProgress)
            .await
        {
            // Status is advisory; the work itself still proceeds
            warn!(work_id = %work.work_id, error = %e, "Failed to mark task in progress");
        }

        let result = item.run(&work.args).await;

        if let Some(ticket) = &ticket {
            if let Err(e) = self.gate.release(ticket).await {
                warn!(
                    work_id = %work.work_id,
                    gate = %ticket.gate_name,
                    error = %e,
                    "Gate release failed; slot will clear by TTL"
                );
            }
        }

        match result {
            Ok(_) => {
                if let Err(e) = self.tracker.mark_completed(&work.work_id).await {
                    warn!(work_id = %work.work_id, error = %e, "Failed to mark task completed");
                }
                debug!(work_id = %work.work_id, work_name = %work.work_name, "Work item completed");
                if let Err(e) = self.queue.ack(WORK_QUEUE_NAME, message.msg_id).await {
                    error!(msg_id = message.msg_id, error = %e, "Failed to ack work item");
                }
            }
            Err(e) => {
                warn!(
                    work_id = %work.work_id,
                    work_name = %work.work_name,
                    delivery_count = message.read_ct,
                    error = %e,
                    "Work item failed; releasing for redelivery"
                );
                self.tracker.mark_failed(&work.work_id, &e.to_string()).await;
                self.nak_logged(message.msg_id).await;
            }
        }
    }

    async fn acquire_gate(
        &self,
        item: &dyn WorkItem,
        work: &WorkItemMessage,
    ) -> Result<Option<GateTicket>, GateError> {
        let Some(spec) = item.gate_spec() else {
            return Ok(None);
        };
        let resolved = gate_name::resolve(&spec.name_template, &work.args);
        let ticket = self
            .gate
            .acquire(&resolved.name, spec.capacity, spec.max_wait, spec.ttl)
            .await?;
        Ok(Some(ticket))
    }

    async fn nak_logged(&self, msg_id: i64) {
        if let Err(e) = self.queue.nak(WORK_QUEUE_NAME, msg_id).await {
            error!(msg_id = msg_id, error = %e, "Failed to nak work item");
        }
    }

    async fn archive_logged(&self, msg_id: i64) {
        if let Err(e) = self.queue.archive(WORK_QUEUE_NAME, msg_id).await {
            error!(msg_id = msg_id, error = %e, "Failed to archive work item");
        }
    }
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
