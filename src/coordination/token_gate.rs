//! # Token Gate
//!
//! ## Overview
//!
//! Distributed counting semaphore limiting how many workers run a given
//! operation at once across the fleet. Each gate is one store key holding a
//! JSON map of holder id to expiry timestamp; all mutations go through
//! compare-and-swap so concurrent acquires and releases never lose entries.
//!
//! ## Expiry
//!
//! Every ticket carries a per-holder TTL. Acquire and release both prune
//! expired holders before counting, so a crashed worker's slot frees itself
//! on the next touch of the gate. The gate key itself expires at twice the
//! ticket TTL as a floor under abandoned gates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::GATE_KEY_PREFIX;
use crate::store::{CoordinationStore, StoreError};

/// Errors from gate operations
#[derive(Debug, Error)]
pub enum GateError {
    /// Capacity stayed exhausted for the whole wait window. Distinct from a
    /// transport failure: the gate is healthy, just full.
    #[error("Gate '{name}' saturated: capacity {capacity} still exhausted after {waited_ms}ms")]
    Saturated {
        name: String,
        capacity: u32,
        waited_ms: u64,
    },

    #[error("Gate capacity must be at least 1")]
    InvalidCapacity,

    #[error("Gate '{name}' state is corrupted: {message}")]
    Corrupted { name: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type GateResult<T> = Result<T, GateError>;

/// Proof of an acquired gate slot, released explicitly or by TTL expiry
#[derive(Debug, Clone)]
pub struct GateTicket {
    pub gate_name: String,
    pub holder_id: String,
    pub expires_at_ms: i64,
}

/// Holder map persisted per gate key: holder id to expiry epoch millis
type HolderMap = HashMap<String, i64>;

/// Distributed counting semaphore over the shared store
#[derive(Clone)]
pub struct TokenGate {
    store: Arc<dyn CoordinationStore>,
    poll_interval: Duration,
}

impl TokenGate {
    pub fn new(store: Arc<dyn CoordinationStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    fn gate_key(name: &str) -> String {
        format!("{GATE_KEY_PREFIX}{name}")
    }

    /// Acquire a slot, polling until `max_wait` elapses.
    ///
    /// Returns [`GateError::Saturated`] when the wait window closes with the
    /// gate still full; store failures surface as [`GateError::Store`].
    pub async fn acquire(
        &self,
        name: &str,
        capacity: u32,
        max_wait: Duration,
        ttl: Duration,
    ) -> GateResult<GateTicket> {
        if capacity == 0 {
            return Err(GateError::InvalidCapacity);
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(ticket) = self.try_acquire_once(name, capacity, ttl).await? {
                return Ok(ticket);
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(GateError::Saturated {
                    name: name.to_string(),
                    capacity,
                    waited_ms: max_wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Single non-blocking acquire attempt; `None` means the gate is full
    pub async fn try_acquire_once(
        &self,
        name: &str,
        capacity: u32,
        ttl: Duration,
    ) -> GateResult<Option<GateTicket>> {
        if capacity == 0 {
            return Err(GateError::InvalidCapacity);
        }
        let key = Self::gate_key(name);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + ttl.as_millis() as i64;
        // Key TTL outlives any single ticket so live holders are never
        // dropped by key expiry
        let key_ttl = ttl * 2;

        loop {
            let current = self.store.get(&key).await?;
            let mut holders = Self::parse_holders(name, current.as_deref())?;
            holders.retain(|_, expiry| *expiry > now_ms);

            if holders.len() as u32 >= capacity {
                debug!(
                    gate = name,
                    capacity = capacity,
                    holders = holders.len(),
                    "Gate full"
                );
                return Ok(None);
            }

            let holder_id = Uuid::new_v4().to_string();
            holders.insert(holder_id.clone(), expires_at_ms);
            let new_value = serde_json::to_string(&holders)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let swapped = self
                .store
                .compare_and_swap(&key, current.as_deref(), &new_value, Some(key_ttl))
                .await?;
            if swapped {
                debug!(
                    gate = name,
                    holder_id = %holder_id,
                    holders = holders.len(),
                    capacity = capacity,
                    "Gate slot acquired"
                );
                return Ok(Some(GateTicket {
                    gate_name: name.to_string(),
                    holder_id,
                    expires_at_ms,
                }));
            }
            // Lost the race, re-read and retry
        }
    }

    /// Release a ticket. Releasing an expired or unknown ticket is a no-op.
    pub async fn release(&self, ticket: &GateTicket) -> GateResult<()> {
        let key = Self::gate_key(&ticket.gate_name);

        loop {
            let current = self.store.get(&key).await?;
            let Some(raw) = current.as_deref() else {
                return Ok(());
            };
            let mut holders = Self::parse_holders(&ticket.gate_name, Some(raw))?;
            let now_ms = chrono::Utc::now().timestamp_millis();
            holders.retain(|_, expiry| *expiry > now_ms);

            if holders.remove(&ticket.holder_id).is_none() && holders.is_empty() {
                // Nothing left to keep; clear the key if unchanged
                self.store.delete_if_value(&key, raw).await?;
                return Ok(());
            }

            let done = if holders.is_empty() {
                self.store.delete_if_value(&key, raw).await?
            } else {
                let new_value = serde_json::to_string(&holders)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                // Keep the key expiring after the last live holder does
                let furthest_ms = holders.values().copied().max().unwrap_or(now_ms);
                let key_ttl =
                    Duration::from_millis(furthest_ms.saturating_sub(now_ms).max(1) as u64) * 2;
                self.store
                    .compare_and_swap(&key, Some(raw), &new_value, Some(key_ttl))
                    .await?
            };
            if done {
                debug!(
                    gate = %ticket.gate_name,
                    holder_id = %ticket.holder_id,
                    "Gate slot released"
                );
                return Ok(());
            }
        }
    }

    /// Number of unexpired holders on the gate
    pub async fn active_holders(&self, name: &str) -> GateResult<u32> {
        let key = Self::gate_key(name);
        let current = self.store.get(&key).await?;
        let holders = Self::parse_holders(name, current.as_deref())?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        Ok(holders.values().filter(|expiry| **expiry > now_ms).count() as u32)
    }

    /// Acquire a slot, run `work`, and always release before returning.
    ///
    /// A release failure is logged but never masks the work's own result.
    pub async fn run_with_gate<T, F, Fut>(
        &self,
        name: &str,
        capacity: u32,
        max_wait: Duration,
        ttl: Duration,
        work: F,
    ) -> GateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let ticket = self.acquire(name, capacity, max_wait, ttl).await?;
        let result = work().await;
        if let Err(e) = self.release(&ticket).await {
            warn!(
                gate = name,
                holder_id = %ticket.holder_id,
                error = %e,
                "Gate release failed; slot will clear by TTL"
            );
        }
        Ok(result)
    }

    fn parse_holders(name: &str, raw: Option<&str>) -> GateResult<HolderMap> {
        match raw {
            None => Ok(HolderMap::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|e| GateError::Corrupted {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for TokenGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGate")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
