//! Cross-process coordination behavior under contention, exercised against
//! the in-memory store.

use fleet_core::coordination::{GateError, LockManager, TokenGate};
use fleet_core::jobs::BatchJobTracker;
use fleet_core::resilience::RetryPolicy;
use fleet_core::store::{CoordinationStore, MemoryStore};
use fleet_core::FleetError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn shared_store() -> Arc<dyn CoordinationStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test]
async fn gate_admits_at_most_capacity_under_contention() {
    let gate = Arc::new(TokenGate::new(shared_store(), Duration::from_millis(5)));
    let capacity = 4u32;
    let contenders = 16;

    let mut handles = Vec::new();
    for _ in 0..contenders {
        let gate = gate.clone();
        handles.push(tokio::spawn(async move {
            gate.try_acquire_once("contended", capacity, Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }

    let mut tickets = Vec::new();
    for handle in handles {
        if let Some(ticket) = handle.await.unwrap() {
            tickets.push(ticket);
        }
    }

    assert_eq!(tickets.len() as u32, capacity);
    assert_eq!(gate.active_holders("contended").await.unwrap(), capacity);

    // Releasing every ticket empties the gate
    for ticket in &tickets {
        gate.release(ticket).await.unwrap();
    }
    assert_eq!(gate.active_holders("contended").await.unwrap(), 0);
}

#[tokio::test]
async fn gate_saturation_is_distinct_from_store_failure() {
    let gate = TokenGate::new(shared_store(), Duration::from_millis(5));
    let _held = gate
        .try_acquire_once("full", 1, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let err = gate
        .acquire("full", 1, Duration::from_millis(30), Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::Saturated { .. }));
    assert!(err.to_string().contains("saturated"));
}

#[tokio::test]
async fn lock_contention_has_exactly_one_winner() {
    let store = shared_store();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let locks = LockManager::new(store.clone(), Duration::from_secs(60));
        handles.push(tokio::spawn(async move {
            locks.acquire_lock("exclusive_op", None).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn distinct_sub_keys_never_contend() {
    let store = shared_store();
    let locks = LockManager::new(store, Duration::from_secs(60));

    for tenant in ["a", "b", "c"] {
        assert!(locks.acquire_lock("rechunk", Some(tenant)).await.unwrap());
    }
    // But the same sub-key does
    assert!(!locks.acquire_lock("rechunk", Some("a")).await.unwrap());
}

#[tokio::test]
async fn lock_released_when_job_creation_conflicts() {
    let store = shared_store();
    let locks = Arc::new(LockManager::new(store.clone(), Duration::from_secs(60)));
    let tracker = BatchJobTracker::new(
        store,
        locks.clone(),
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        Duration::from_secs(3600),
    );

    let first = tracker
        .begin_exclusive_job("fact_check", None, "fact_check", 1, HashMap::new())
        .await
        .unwrap();

    let conflict = tracker
        .begin_exclusive_job("fact_check", None, "fact_check", 1, HashMap::new())
        .await;
    assert!(matches!(conflict, Err(FleetError::Conflict { .. })));

    // Cancelling the winner frees the scope for the next exclusive job
    tracker.cancel_job(first.id).await.unwrap();
    assert!(!locks.is_locked("fact_check", None).await.unwrap());
    tracker
        .begin_exclusive_job("fact_check", None, "fact_check", 1, HashMap::new())
        .await
        .unwrap();
}

/// Store double that accepts conditional writes (locks) but fails plain
/// sets (job persistence), to exercise the release-on-failure contract.
struct JobWriteFailingStore {
    inner: MemoryStore,
}

#[async_trait::async_trait]
impl CoordinationStore for JobWriteFailingStore {
    async fn get(&self, key: &str) -> fleet_core::store::StoreResult<Option<String>> {
        self.inner.get(key).await
    }
    async fn set(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Option<Duration>,
    ) -> fleet_core::store::StoreResult<()> {
        Err(fleet_core::store::StoreError::connection("write path down"))
    }
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> fleet_core::store::StoreResult<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> fleet_core::store::StoreResult<bool> {
        self.inner.compare_and_swap(key, expected, new, ttl).await
    }
    async fn delete(&self, key: &str) -> fleet_core::store::StoreResult<()> {
        self.inner.delete(key).await
    }
    async fn delete_if_value(
        &self,
        key: &str,
        expected: &str,
    ) -> fleet_core::store::StoreResult<bool> {
        self.inner.delete_if_value(key, expected).await
    }
    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> fleet_core::store::StoreResult<Vec<(String, String)>> {
        self.inner.scan_prefix(prefix).await
    }
    async fn health_check(&self) -> fleet_core::store::StoreResult<bool> {
        Ok(true)
    }
    fn provider_name(&self) -> &'static str {
        "job_write_failing"
    }
}

#[tokio::test]
async fn lock_released_when_job_creation_fails_after_acquire() {
    let store: Arc<dyn CoordinationStore> = Arc::new(JobWriteFailingStore {
        inner: MemoryStore::new(),
    });
    let locks = Arc::new(LockManager::new(store.clone(), Duration::from_secs(60)));
    let tracker = BatchJobTracker::new(
        store,
        locks.clone(),
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        Duration::from_secs(3600),
    );

    let result = tracker
        .begin_exclusive_job("fact_check", None, "fact_check", 1, HashMap::new())
        .await;
    assert!(result.is_err());
    // Not a conflict: the lock was free, job persistence failed
    assert!(!matches!(result, Err(FleetError::Conflict { .. })));

    // The failed attempt did not leave the lock behind
    assert!(!locks.is_locked("fact_check", None).await.unwrap());
    assert!(locks.acquire_lock("fact_check", None).await.unwrap());
}

#[tokio::test]
async fn run_with_gate_releases_on_panic_free_failure_paths() {
    let gate = TokenGate::new(shared_store(), Duration::from_millis(5));

    // Work returning an application error still releases the slot
    let result: Result<(), &str> = gate
        .run_with_gate(
            "g",
            1,
            Duration::from_millis(50),
            Duration::from_secs(60),
            || async { Err("work failed") },
        )
        .await
        .unwrap();
    assert!(result.is_err());
    assert_eq!(gate.active_holders("g").await.unwrap(), 0);
}
