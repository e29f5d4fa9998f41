//! # Task Status Tracker
//!
//! TTL-bound status records in the shared store, one per async task. Writes
//! that matter for correctness (create) are verified by reading the record
//! back, so a silently dropped write surfaces immediately instead of as a
//! phantom task later. Failure marking is deliberately best-effort: it runs
//! on error paths where raising again would mask the original problem.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{AsyncTask, TaskLookupError, TaskStatus};
use crate::constants::TASK_KEY_PREFIX;
use crate::error::Result;
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::store::{CoordinationStore, StoreError};

/// Tracks async task status records with TTL expiry
#[derive(Clone)]
pub struct TaskStatusTracker {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    retry: RetryPolicy,
}

impl TaskStatusTracker {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration, retry: RetryPolicy) -> Self {
        Self { store, ttl, retry }
    }

    fn task_key(task_id: &str) -> String {
        format!("{TASK_KEY_PREFIX}{task_id}")
    }

    async fn persist(&self, task: &AsyncTask) -> Result<()> {
        let key = Self::task_key(&task.task_id);
        let value = serde_json::to_string(task)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        retry_with_backoff(&self.retry, "persist_task_record", || async {
            self.store.set(&key, &value, Some(self.ttl)).await
        })
        .await?;
        Ok(())
    }

    /// Create a task record and verify it landed.
    ///
    /// The read-back catches backends that accept writes and drop them;
    /// without it a lost create would only show up as a confusing
    /// `not_found` much later.
    pub async fn create_task(
        &self,
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        scope_key: Option<String>,
        batch_size: u32,
    ) -> Result<AsyncTask> {
        let task = AsyncTask::new(task_id, task_type, scope_key, batch_size);
        self.persist(&task).await?;

        let verified = self.store.get(&Self::task_key(&task.task_id)).await?;
        if verified.is_none() {
            return Err(StoreError::command(
                "create_task",
                format!("Task record {} missing after write", task.task_id),
            )
            .into());
        }

        debug!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            "Task record created"
        );
        Ok(task)
    }

    /// Load a task record; `None` when absent or expired
    pub async fn get_task(&self, task_id: &str) -> Result<Option<AsyncTask>> {
        match self.get_task_or_error(task_id).await {
            Ok(task) => Ok(Some(task)),
            Err(TaskLookupError::NotFound { .. }) => Ok(None),
            Err(TaskLookupError::BackendError { message, .. }) => {
                Err(StoreError::command("get_task", message).into())
            }
            Err(e @ TaskLookupError::ParseError { .. }) => Err(crate::error::FleetError::from(e)),
        }
    }

    /// Load a task record with a differentiated error on every miss path
    pub async fn get_task_or_error(
        &self,
        task_id: &str,
    ) -> std::result::Result<AsyncTask, TaskLookupError> {
        let raw = self
            .store
            .get(&Self::task_key(task_id))
            .await
            .map_err(|e| TaskLookupError::BackendError {
                task_id: task_id.to_string(),
                message: e.to_string(),
            })?
            .ok_or_else(|| TaskLookupError::NotFound {
                task_id: task_id.to_string(),
            })?;

        serde_json::from_str(&raw).map_err(|e| TaskLookupError::ParseError {
            task_id: task_id.to_string(),
            message: e.to_string(),
        })
    }

    /// Set the task's status; refreshes the record TTL
    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<AsyncTask> {
        self.mutate(task_id, |task| {
            task.status = status;
        })
        .await
    }

    /// Record progress counts; refreshes the record TTL
    pub async fn update_progress(
        &self,
        task_id: &str,
        processed_count: u32,
        total_count: Option<u32>,
    ) -> Result<AsyncTask> {
        self.mutate(task_id, |task| {
            task.processed_count = processed_count;
            if total_count.is_some() {
                task.total_count = total_count;
            }
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::InProgress;
            }
        })
        .await
    }

    pub async fn mark_completed(&self, task_id: &str) -> Result<AsyncTask> {
        self.mutate(task_id, |task| {
            task.status = TaskStatus::Completed;
            task.error = None;
        })
        .await
    }

    /// Mark a task failed, best-effort. Runs on error paths, so every
    /// failure here is logged and swallowed; returns the updated record
    /// when the write succeeded.
    pub async fn mark_failed(&self, task_id: &str, error_message: &str) -> Option<AsyncTask> {
        match self
            .mutate(task_id, |task| {
                task.status = TaskStatus::Failed;
                task.error = Some(error_message.to_string());
            })
            .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                error!(
                    task_id = task_id,
                    error = %e,
                    "Failed to mark task as failed; original error already logged by caller"
                );
                None
            }
        }
    }

    /// Mark a task failed even when the existing record is missing or
    /// unreadable, synthesizing a fresh Failed record in its place
    pub async fn mark_failed_force(
        &self,
        task_id: &str,
        task_type: &str,
        error_message: &str,
    ) -> Result<AsyncTask> {
        let mut task = match self.get_task_or_error(task_id).await {
            Ok(task) => task,
            Err(reason) => {
                warn!(
                    task_id = task_id,
                    reason = reason.reason(),
                    "Existing task record unusable; writing fresh failed record"
                );
                AsyncTask::new(task_id, task_type, None, 0)
            }
        };
        task.status = TaskStatus::Failed;
        task.error = Some(error_message.to_string());
        task.updated_at = Utc::now();
        self.persist(&task).await?;
        Ok(task)
    }

    /// All live task records, optionally filtered by status. Malformed
    /// records are logged and skipped.
    pub async fn list_tasks(&self, status_filter: Option<TaskStatus>) -> Result<Vec<AsyncTask>> {
        let entries = self.store.scan_prefix(TASK_KEY_PREFIX).await?;
        let mut tasks = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            match serde_json::from_str::<AsyncTask>(&raw) {
                Ok(task) => {
                    if status_filter.is_none_or(|s| task.status == s) {
                        tasks.push(task);
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping malformed task record");
                }
            }
        }
        Ok(tasks)
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.store.delete(&Self::task_key(task_id)).await?;
        Ok(())
    }

    async fn mutate(
        &self,
        task_id: &str,
        apply: impl FnOnce(&mut AsyncTask),
    ) -> Result<AsyncTask> {
        let mut task = match self.get_task_or_error(task_id).await {
            Ok(task) => task,
            Err(TaskLookupError::BackendError { message, .. }) => {
                return Err(StoreError::command("mutate_task", message).into());
            }
            Err(e) => return Err(crate::error::FleetError::from(e)),
        };
        apply(&mut task);
        task.updated_at = Utc::now();
        self.persist(&task).await?;
        Ok(task)
    }
}

impl std::fmt::Debug for TaskStatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStatusTracker")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
