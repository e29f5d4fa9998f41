//! # Configuration
//!
//! Environment-driven configuration with typed defaults. Every knob the
//! coordination core exposes lives here so process startup is explicit and
//! ordered rather than first-call-wins.

use crate::constants;
use crate::error::{FleetError, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Connection URL for the shared coordination store
    pub redis_url: String,
    /// Connection URL for the durable queue backend
    pub database_url: String,
    /// Stream name from which event subjects are derived
    pub stream_name: String,
    /// Queue group shared by all instances of a deployment
    pub queue_group: String,
    /// Seconds a read message stays invisible before redelivery
    pub visibility_timeout_secs: u32,
    /// Per-handler execution deadline in milliseconds
    pub handler_timeout_ms: u64,
    /// Delivery-count ceiling beyond which a message is dropped as poison
    pub max_delivery: u32,
    /// Messages fetched per poll
    pub batch_size: usize,
    /// Sleep between empty polls, milliseconds
    pub poll_interval_ms: u64,
    /// Sleep between gate acquisition attempts, milliseconds
    pub gate_poll_interval_ms: u64,
    /// Safety TTL for gate tickets, seconds
    pub gate_default_ttl_secs: u64,
    /// Safety TTL for exclusive locks, seconds
    pub lock_ttl_secs: u64,
    /// TTL for async task status records, seconds
    pub task_record_ttl_secs: u64,
    /// In-progress jobs idle longer than this are reaped as stale, seconds
    pub stale_job_threshold_secs: u64,
    /// Max attempts for transient store errors on create/read paths
    pub retry_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgresql://localhost/fleet_development".to_string(),
            stream_name: constants::DEFAULT_STREAM_NAME.to_string(),
            queue_group: constants::DEFAULT_QUEUE_GROUP.to_string(),
            visibility_timeout_secs: 30,
            handler_timeout_ms: 30_000,
            max_delivery: constants::DEFAULT_MAX_DELIVERY,
            batch_size: 10,
            poll_interval_ms: 250,
            gate_poll_interval_ms: 200,
            gate_default_ttl_secs: constants::DEFAULT_GATE_TTL_SECS,
            lock_ttl_secs: constants::DEFAULT_LOCK_TTL_SECS,
            task_record_ttl_secs: constants::DEFAULT_TASK_RECORD_TTL_SECS,
            stale_job_threshold_secs: constants::DEFAULT_STALE_JOB_THRESHOLD_SECS,
            retry_max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
        }
    }
}

impl FleetConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults. Every numeric knob has a `FLEET_`-prefixed override.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(stream) = std::env::var("FLEET_STREAM_NAME") {
            config.stream_name = stream;
        }
        if let Ok(group) = std::env::var("FLEET_QUEUE_GROUP") {
            config.queue_group = group;
        }

        env_override(
            "FLEET_VISIBILITY_TIMEOUT_SECS",
            &mut config.visibility_timeout_secs,
        )?;
        env_override("FLEET_HANDLER_TIMEOUT_MS", &mut config.handler_timeout_ms)?;
        env_override("FLEET_MAX_DELIVERY", &mut config.max_delivery)?;
        env_override("FLEET_BATCH_SIZE", &mut config.batch_size)?;
        env_override("FLEET_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        env_override(
            "FLEET_GATE_POLL_INTERVAL_MS",
            &mut config.gate_poll_interval_ms,
        )?;
        env_override("FLEET_GATE_TTL_SECS", &mut config.gate_default_ttl_secs)?;
        env_override("FLEET_LOCK_TTL_SECS", &mut config.lock_ttl_secs)?;
        env_override(
            "FLEET_TASK_RECORD_TTL_SECS",
            &mut config.task_record_ttl_secs,
        )?;
        env_override(
            "FLEET_STALE_JOB_THRESHOLD_SECS",
            &mut config.stale_job_threshold_secs,
        )?;
        env_override("FLEET_RETRY_MAX_ATTEMPTS", &mut config.retry_max_attempts)?;
        env_override("FLEET_BACKOFF_BASE_MS", &mut config.backoff_base_ms)?;
        env_override("FLEET_BACKOFF_MAX_MS", &mut config.backoff_max_ms)?;

        Ok(config)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn gate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.gate_poll_interval_ms)
    }

    pub fn gate_default_ttl(&self) -> Duration {
        Duration::from_secs(self.gate_default_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn task_record_ttl(&self) -> Duration {
        Duration::from_secs(self.task_record_ttl_secs)
    }

    pub fn stale_job_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_job_threshold_secs)
    }
}

/// Replace `target` with the parsed value of `var` when the variable is set
fn env_override<T: std::str::FromStr>(var: &str, target: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(var) {
        *target = raw
            .parse()
            .map_err(|e| FleetError::Configuration(format!("Invalid {var}: {e}")))?;
    }
    Ok(())
}
