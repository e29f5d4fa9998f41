//! # Batch Job Tracking
//!
//! Lifecycle records for long-running batch jobs, persisted durably in the
//! shared store so any worker instance can observe, advance, or cancel a
//! job started elsewhere.

pub mod tracker;

pub use tracker::BatchJobTracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Metadata key recording the lock operation a job holds
pub const LOCK_OP_METADATA_KEY: &str = "lock_op";
/// Metadata key recording the lock sub-key a job holds
pub const LOCK_SUB_KEY_METADATA_KEY: &str = "lock_sub_key";

/// Batch job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl BatchJobStatus {
    /// Whether this state permits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchJobStatus::Completed | BatchJobStatus::Failed | BatchJobStatus::Cancelled
        )
    }

}

impl fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchJobStatus::Pending => "pending",
            BatchJobStatus::InProgress => "in_progress",
            BatchJobStatus::Completed => "completed",
            BatchJobStatus::Failed => "failed",
            BatchJobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BatchJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchJobStatus::Pending),
            "in_progress" => Ok(BatchJobStatus::InProgress),
            "completed" => Ok(BatchJobStatus::Completed),
            "failed" => Ok(BatchJobStatus::Failed),
            "cancelled" => Ok(BatchJobStatus::Cancelled),
            _ => Err(format!("Invalid batch job status: {s}")),
        }
    }
}

/// Persistent record for one batch job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub job_type: String,
    pub status: BatchJobStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Bumped on every mutation; staleness is judged against this, not
    /// `created_at`, so a slow but advancing job is never reaped
    pub updated_at: DateTime<Utc>,
    pub error_summary: Option<String>,
    /// Handle to an external workflow engine execution, when one exists
    pub external_workflow_id: Option<String>,
}

impl BatchJob {
    pub fn new(job_type: impl Into<String>, total_tasks: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            status: BatchJobStatus::Pending,
            total_tasks,
            completed_tasks: 0,
            metadata: HashMap::new(),
            created_at: now,
            started_at: None,
            updated_at: now,
            error_summary: None,
            external_workflow_id: None,
        }
    }

    /// Whether the job is running but has not been touched within
    /// `threshold`. Only `InProgress` jobs can go stale; a `Pending` job
    /// has no worker whose progress could be judged.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        if self.status != BatchJobStatus::InProgress {
            return false;
        }
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => now - self.updated_at > threshold,
            Err(_) => false,
        }
    }
}

/// Errors from batch job operations
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Batch job not found: {id}")]
    NotFound { id: Uuid },

    #[error("Invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: BatchJobStatus,
        to: BatchJobStatus,
    },

    #[error("Failed to serialize batch job: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type JobResult<T> = Result<T, JobError>;
