//! # Distributed Lock Manager
//!
//! Non-blocking try-locks over the shared store. A lock is a single key
//! written with set-if-absent and a TTL; the TTL guarantees a crashed
//! holder's lock eventually clears without an external reaper. Callers that
//! fail to acquire get `false` back and decide for themselves whether that
//! is a retry, a skip, or an error.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::LOCK_KEY_PREFIX;
use crate::error::Result;
use crate::store::CoordinationStore;

/// Manages exclusive operation locks in the shared store
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Composite lock key for an operation and optional sub-scope.
    ///
    /// Distinct sub-keys under the same operation do not contend.
    pub fn lock_key(operation: &str, sub_key: Option<&str>) -> String {
        match sub_key {
            Some(sub) => format!("{LOCK_KEY_PREFIX}{operation}:{sub}"),
            None => format!("{LOCK_KEY_PREFIX}{operation}"),
        }
    }

    /// Try to acquire the lock; returns whether this caller now holds it.
    /// Never blocks or retries.
    pub async fn acquire_lock(&self, operation: &str, sub_key: Option<&str>) -> Result<bool> {
        let key = Self::lock_key(operation, sub_key);
        let acquired_at = chrono::Utc::now().to_rfc3339();
        let acquired = self
            .store
            .set_if_absent(&key, &acquired_at, Some(self.ttl))
            .await?;

        if acquired {
            info!(
                lock_key = %key,
                ttl_secs = self.ttl.as_secs(),
                "Lock acquired"
            );
        } else {
            debug!(lock_key = %key, "Lock already held");
        }
        Ok(acquired)
    }

    /// Release the lock. Releasing a lock that is not held (already expired
    /// or never acquired) is a no-op.
    pub async fn release_lock(&self, operation: &str, sub_key: Option<&str>) -> Result<()> {
        let key = Self::lock_key(operation, sub_key);
        self.store.delete(&key).await?;
        debug!(lock_key = %key, "Lock released");
        Ok(())
    }

    /// Whether the lock is currently held by anyone
    pub async fn is_locked(&self, operation: &str, sub_key: Option<&str>) -> Result<bool> {
        let key = Self::lock_key(operation, sub_key);
        Ok(self.store.get(&key).await?.is_some())
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
