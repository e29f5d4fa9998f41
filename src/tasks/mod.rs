//! # Async Task Tracking and Dispatch
//!
//! Short-lived status records for individual async tasks, plus the
//! dispatcher that enqueues work items and runs them behind concurrency
//! gates on the worker side.

pub mod dispatcher;
pub mod tracker;

pub use dispatcher::{
    DispatchError, DispatchReceipt, DispatcherConfig, GateSpec, TaskDispatcher, WorkError,
    WorkItem, WorkItemRegistry,
};
pub use tracker::TaskStatusTracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Async task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Status record for one async task, stored with a TTL so finished tasks
/// age out on their own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub task_id: String,
    pub task_type: String,
    /// Optional scope the task operates on (tenant, collection, shard)
    pub scope_key: Option<String>,
    pub batch_size: u32,
    pub status: TaskStatus,
    pub processed_count: u32,
    pub total_count: Option<u32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncTask {
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        scope_key: Option<String>,
        batch_size: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            scope_key,
            batch_size,
            status: TaskStatus::Pending,
            processed_count: 0,
            total_count: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Why a task lookup did not produce a record.
///
/// Callers branch on these: a missing record may just mean the task
/// finished and aged out, while a backend or parse failure means the
/// answer is unknown.
#[derive(Debug, Error)]
pub enum TaskLookupError {
    #[error("Task not found: {task_id}")]
    NotFound { task_id: String },

    #[error("Backend error looking up task {task_id}: {message}")]
    BackendError { task_id: String, message: String },

    #[error("Task record for {task_id} could not be parsed: {message}")]
    ParseError { task_id: String, message: String },
}

impl TaskLookupError {
    /// Stable reason code for logs and API responses
    pub fn reason(&self) -> &'static str {
        match self {
            TaskLookupError::NotFound { .. } => "not_found",
            TaskLookupError::BackendError { .. } => "backend_error",
            TaskLookupError::ParseError { .. } => "parse_error",
        }
    }
}
