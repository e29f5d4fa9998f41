//! # Batch Job Tracker
//!
//! Persists [`BatchJob`] records in the shared store and enforces the
//! lifecycle state machine. Jobs that hold an exclusive lock record the lock
//! coordinates in their metadata so cancellation and staleness sweeps can
//! release the lock on the job's behalf.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    BatchJob, BatchJobStatus, JobError, LOCK_OP_METADATA_KEY, LOCK_SUB_KEY_METADATA_KEY,
};
use crate::constants::JOB_KEY_PREFIX;
use crate::coordination::LockManager;
use crate::error::{CleanupFailure, FleetError, Result};
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::store::CoordinationStore;

/// Tracks batch job lifecycle in the shared store
#[derive(Clone)]
pub struct BatchJobTracker {
    store: Arc<dyn CoordinationStore>,
    locks: Arc<LockManager>,
    retry: RetryPolicy,
    stale_threshold: Duration,
}

impl BatchJobTracker {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        locks: Arc<LockManager>,
        retry: RetryPolicy,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            retry,
            stale_threshold,
        }
    }

    fn job_key(id: Uuid) -> String {
        format!("{JOB_KEY_PREFIX}{id}")
    }

    fn serialize(job: &BatchJob) -> Result<String> {
        serde_json::to_string(job)
            .map_err(|e| JobError::Serialization(e.to_string()).into())
    }

    async fn persist(&self, job: &BatchJob) -> Result<()> {
        let key = Self::job_key(job.id);
        let value = Self::serialize(job)?;
        retry_with_backoff(&self.retry, "persist_batch_job", || async {
            self.store.set(&key, &value, None).await
        })
        .await
        .map_err(JobError::Store)?;
        Ok(())
    }

    /// Create and persist a new job record in `Pending`
    pub async fn create_job(
        &self,
        job_type: impl Into<String>,
        total_tasks: u32,
        metadata: std::collections::HashMap<String, String>,
    ) -> Result<BatchJob> {
        let mut job = BatchJob::new(job_type, total_tasks);
        job.metadata = metadata;
        self.persist(&job).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            total_tasks = total_tasks,
            "Batch job created"
        );
        Ok(job)
    }

    /// Load a job record; `Err(NotFound)` when absent
    pub async fn get_job(&self, id: Uuid) -> Result<BatchJob> {
        let raw = self
            .store
            .get(&Self::job_key(id))
            .await
            .map_err(JobError::Store)?
            .ok_or(JobError::NotFound { id })?;
        let job = serde_json::from_str(&raw)
            .map_err(|e| JobError::Serialization(e.to_string()))?;
        Ok(job)
    }

    /// Apply a mutation to a job record through a compare-and-swap loop.
    /// Concurrent writers on other instances re-read and retry instead of
    /// overwriting each other, so no update is ever lost.
    async fn mutate_job(
        &self,
        id: Uuid,
        mut apply: impl FnMut(&mut BatchJob) -> std::result::Result<(), JobError>,
    ) -> Result<BatchJob> {
        let key = Self::job_key(id);
        loop {
            let raw = self
                .store
                .get(&key)
                .await
                .map_err(JobError::Store)?
                .ok_or(JobError::NotFound { id })?;
            let mut job: BatchJob = serde_json::from_str(&raw)
                .map_err(|e| JobError::Serialization(e.to_string()))?;
            apply(&mut job)?;
            job.updated_at = Utc::now();

            let new_value = Self::serialize(&job)?;
            let swapped = self
                .store
                .compare_and_swap(&key, Some(raw.as_str()), &new_value, None)
                .await
                .map_err(JobError::Store)?;
            if swapped {
                return Ok(job);
            }
            // Lost the race, re-read and retry
        }
    }

    /// Transition `Pending` -> `InProgress`, stamping `started_at`
    pub async fn start_job(&self, id: Uuid) -> Result<BatchJob> {
        let job = self
            .mutate_job(id, |job| {
                if job.status != BatchJobStatus::Pending {
                    return Err(JobError::InvalidTransition {
                        id,
                        from: job.status,
                        to: BatchJobStatus::InProgress,
                    });
                }
                job.status = BatchJobStatus::InProgress;
                job.started_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!(job_id = %id, "Batch job started");
        Ok(job)
    }

    /// Add completed task count. Every call bumps `updated_at`, which is
    /// what keeps an advancing job out of the staleness sweep.
    pub async fn update_progress(&self, id: Uuid, completed_delta: u32) -> Result<BatchJob> {
        self.mutate_job(id, |job| {
            if job.status.is_terminal() {
                return Err(JobError::InvalidTransition {
                    id,
                    from: job.status,
                    to: job.status,
                });
            }
            job.completed_tasks = job
                .completed_tasks
                .saturating_add(completed_delta)
                .min(job.total_tasks);
            Ok(())
        })
        .await
    }

    /// Transition an active job to `Completed`
    pub async fn complete_job(&self, id: Uuid) -> Result<BatchJob> {
        self.finish(id, BatchJobStatus::Completed, None).await
    }

    /// Transition an active job to `Failed` with an error summary
    pub async fn fail_job(&self, id: Uuid, error_summary: impl Into<String>) -> Result<BatchJob> {
        self.finish(id, BatchJobStatus::Failed, Some(error_summary.into()))
            .await
    }

    /// Cancel an active job. Any lock recorded in the job's metadata is
    /// released before this returns, so a follow-up job can start
    /// immediately rather than waiting out the lock TTL.
    pub async fn cancel_job(&self, id: Uuid) -> Result<BatchJob> {
        let job = self
            .finish(id, BatchJobStatus::Cancelled, None)
            .await?;
        self.release_job_lock(&job).await;
        Ok(job)
    }

    /// Record the external workflow engine handle on a job
    pub async fn set_external_workflow_handle(
        &self,
        id: Uuid,
        workflow_id: impl Into<String>,
    ) -> Result<BatchJob> {
        let workflow_id = workflow_id.into();
        self.mutate_job(id, |job| {
            job.external_workflow_id = Some(workflow_id.clone());
            Ok(())
        })
        .await
    }

    /// Sweep active jobs whose `updated_at` is older than the staleness
    /// threshold, failing each and releasing any lock it held. Malformed
    /// records are logged and skipped, never aborting the sweep.
    pub async fn cleanup_stale_jobs(&self) -> Result<Vec<Uuid>> {
        let entries = self
            .store
            .scan_prefix(JOB_KEY_PREFIX)
            .await
            .map_err(JobError::Store)?;
        let now = Utc::now();
        let mut reaped = Vec::new();

        for (key, raw) in entries {
            let mut job: BatchJob = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping malformed batch job record");
                    continue;
                }
            };
            if !job.is_stale(self.stale_threshold, now) {
                continue;
            }

            let idle_secs = (now - job.updated_at).num_seconds();
            job.status = BatchJobStatus::Failed;
            job.error_summary = Some(format!(
                "Job marked stale: no progress for {idle_secs}s (threshold {}s)",
                self.stale_threshold.as_secs()
            ));
            job.updated_at = now;

            // Swap against the scanned value so a job that progressed (or
            // finished) since the scan is left alone
            let new_value = Self::serialize(&job)?;
            let swapped = self
                .store
                .compare_and_swap(&key, Some(raw.as_str()), &new_value, None)
                .await
                .map_err(JobError::Store)?;
            if !swapped {
                continue;
            }
            self.release_job_lock(&job).await;

            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                idle_secs = idle_secs,
                "Stale batch job failed by sweep"
            );
            reaped.push(job.id);
        }
        Ok(reaped)
    }

    /// Acquire the named lock, then create the job that owns it.
    ///
    /// Returns [`FleetError::Conflict`] when the lock is already held. If
    /// job creation fails after acquisition, the lock is released before
    /// the error is returned; a failed release is attached as cleanup
    /// context rather than masking the primary error.
    pub async fn begin_exclusive_job(
        &self,
        operation: &str,
        sub_key: Option<&str>,
        job_type: impl Into<String>,
        total_tasks: u32,
        mut metadata: std::collections::HashMap<String, String>,
    ) -> Result<BatchJob> {
        if !self.locks.acquire_lock(operation, sub_key).await? {
            return Err(FleetError::conflict(LockManager::lock_key(
                operation, sub_key,
            )));
        }

        metadata.insert(LOCK_OP_METADATA_KEY.to_string(), operation.to_string());
        if let Some(sub) = sub_key {
            metadata.insert(LOCK_SUB_KEY_METADATA_KEY.to_string(), sub.to_string());
        }

        match self.create_job(job_type, total_tasks, metadata).await {
            Ok(job) => Ok(job),
            Err(primary) => {
                let failure = match self.locks.release_lock(operation, sub_key).await {
                    Ok(()) => CleanupFailure::new(primary),
                    Err(release_error) => {
                        error!(
                            operation = operation,
                            error = %release_error,
                            "Failed to release lock after job creation failure"
                        );
                        CleanupFailure::new(primary).with_cleanup_error(release_error.to_string())
                    }
                };
                Err(failure.into())
            }
        }
    }

    /// Release the lock recorded in a job's metadata, if any. Failures are
    /// logged; the lock TTL is the fallback.
    async fn release_job_lock(&self, job: &BatchJob) {
        let Some(operation) = job.metadata.get(LOCK_OP_METADATA_KEY) else {
            return;
        };
        let sub_key = job.metadata.get(LOCK_SUB_KEY_METADATA_KEY);
        if let Err(e) = self
            .locks
            .release_lock(operation, sub_key.map(String::as_str))
            .await
        {
            error!(
                job_id = %job.id,
                operation = %operation,
                error = %e,
                "Failed to release job lock; TTL will clear it"
            );
        }
    }

    async fn finish(
        &self,
        id: Uuid,
        to: BatchJobStatus,
        error_summary: Option<String>,
    ) -> Result<BatchJob> {
        let job = self
            .mutate_job(id, |job| {
                if job.status.is_terminal() {
                    return Err(JobError::InvalidTransition {
                        id,
                        from: job.status,
                        to,
                    });
                }
                job.status = to;
                job.error_summary = error_summary.clone();
                Ok(())
            })
            .await?;
        info!(job_id = %id, status = %to, "Batch job finished");
        Ok(job)
    }
}

impl std::fmt::Debug for BatchJobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchJobTracker")
            .field("stale_threshold", &self.stale_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn tracker_with_threshold(threshold: Duration) -> BatchJobTracker {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockManager::new(store.clone(), Duration::from_secs(60)));
        let retry = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
        BatchJobTracker::new(store, locks, retry, threshold)
    }

    fn tracker() -> BatchJobTracker {
        tracker_with_threshold(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let tracker = tracker();
        let job = tracker
            .create_job("rechunk", 5, HashMap::new())
            .await
            .unwrap();
        let loaded = tracker.get_job(job.id).await.unwrap();
        assert_eq!(loaded.job_type, "rechunk");
        assert_eq!(loaded.status, BatchJobStatus::Pending);
        assert_eq!(loaded.total_tasks, 5);
    }

    #[tokio::test]
    async fn test_get_missing_job_is_not_found() {
        let tracker = tracker();
        let result = tracker.get_job(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(FleetError::Job(JobError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let tracker = tracker();
        let job = tracker
            .create_job("rechunk", 2, HashMap::new())
            .await
            .unwrap();

        let started = tracker.start_job(job.id).await.unwrap();
        assert_eq!(started.status, BatchJobStatus::InProgress);
        assert!(started.started_at.is_some());

        let progressed = tracker.update_progress(job.id, 2).await.unwrap();
        assert_eq!(progressed.completed_tasks, 2);

        let completed = tracker.complete_job(job.id).await.unwrap();
        assert_eq!(completed.status, BatchJobStatus::Completed);

        // Terminal jobs reject further transitions
        assert!(tracker.fail_job(job.id, "late").await.is_err());
        assert!(tracker.update_progress(job.id, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_start_requires_pending() {
        let tracker = tracker();
        let job = tracker
            .create_job("rechunk", 1, HashMap::new())
            .await
            .unwrap();
        tracker.start_job(job.id).await.unwrap();
        assert!(tracker.start_job(job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_begin_exclusive_job_holds_lock() {
        let tracker = tracker();
        let job = tracker
            .begin_exclusive_job("rechunk", Some("tenant_a"), "rechunk", 3, HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            job.metadata.get(LOCK_OP_METADATA_KEY).map(String::as_str),
            Some("rechunk")
        );

        // Second attempt on the same scope conflicts
        let second = tracker
            .begin_exclusive_job("rechunk", Some("tenant_a"), "rechunk", 3, HashMap::new())
            .await;
        assert!(matches!(second, Err(FleetError::Conflict { .. })));

        // A different sub-key proceeds
        tracker
            .begin_exclusive_job("rechunk", Some("tenant_b"), "rechunk", 3, HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_lock() {
        let tracker = tracker();
        let job = tracker
            .begin_exclusive_job("rechunk", None, "rechunk", 3, HashMap::new())
            .await
            .unwrap();

        let cancelled = tracker.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, BatchJobStatus::Cancelled);

        // Lock is free immediately, not after TTL
        let again = tracker
            .begin_exclusive_job("rechunk", None, "rechunk", 3, HashMap::new())
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_stale_sweep_fails_idle_jobs_only() {
        let tracker = tracker_with_threshold(Duration::from_millis(50));
        let idle = tracker
            .create_job("rechunk", 1, HashMap::new())
            .await
            .unwrap();
        tracker.start_job(idle.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        // A job that just progressed is not stale
        let active = tracker
            .create_job("digest", 1, HashMap::new())
            .await
            .unwrap();

        let reaped = tracker.cleanup_stale_jobs().await.unwrap();
        assert_eq!(reaped, vec![idle.id]);

        let failed = tracker.get_job(idle.id).await.unwrap();
        assert_eq!(failed.status, BatchJobStatus::Failed);
        assert!(failed.error_summary.unwrap().contains("stale"));

        let untouched = tracker.get_job(active.id).await.unwrap();
        assert_eq!(untouched.status, BatchJobStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_sweep_spares_unstarted_jobs() {
        let tracker = tracker_with_threshold(Duration::from_millis(50));
        let pending = tracker
            .create_job("rechunk", 1, HashMap::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Old but never started: not the sweep's business
        let reaped = tracker.cleanup_stale_jobs().await.unwrap();
        assert!(reaped.is_empty());
        let survivor = tracker.get_job(pending.id).await.unwrap();
        assert_eq!(survivor.status, BatchJobStatus::Pending);
    }

    #[tokio::test]
    async fn test_set_external_workflow_handle() {
        let tracker = tracker();
        let job = tracker
            .create_job("digest", 1, HashMap::new())
            .await
            .unwrap();
        let updated = tracker
            .set_external_workflow_handle(job.id, "wf-exec-42")
            .await
            .unwrap();
        assert_eq!(updated.external_workflow_id.as_deref(), Some("wf-exec-42"));
    }
}
