//! # Shared Coordination Store
//!
//! Abstraction over the external key-value store that every worker process
//! shares. All cross-process state transitions are expressed as atomic
//! conditional operations (set-if-absent for locks, compare-and-swap for gate
//! holder maps) rather than read-modify-write sequences, so concurrent
//! processes cannot lose updates.
//!
//! Providers:
//! - [`MemoryStore`] - in-process map with per-entry expiry, for tests and
//!   single-process deployments
//! - [`RedisStore`] - distributed backend (feature `store-redis`)

pub mod memory;
#[cfg(feature = "store-redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "store-redis")]
pub use redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from the shared store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command error: {operation}: {message}")]
    Command { operation: String, message: String },

    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn command(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Operations the coordination primitives need from the shared store.
///
/// `ttl` of `None` means the entry is durable; `Some` entries self-expire.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Get a value by key; `None` on miss or expiry
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally set a value
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set only if the key is absent; returns whether the write happened
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Atomically replace the value only if the current value matches
    /// `expected` (`None` expects the key to be absent); returns whether the
    /// swap happened
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Delete a key; deleting an absent key is a no-op
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete only if the current value matches; returns whether a delete
    /// happened
    async fn delete_if_value(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// List all live entries whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Check backend health
    async fn health_check(&self) -> StoreResult<bool>;

    /// Provider name for logging and diagnostics
    fn provider_name(&self) -> &'static str;
}
