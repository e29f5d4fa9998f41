//! # System Constants
//!
//! Key namespaces, queue naming, and operational defaults shared across the
//! coordination core. Each concern gets a distinct key prefix in the shared
//! store so that locks, gates, and tracker records never collide.

/// Key prefix for exclusive operation locks
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Key prefix for token gate holder maps
pub const GATE_KEY_PREFIX: &str = "gate:";

/// Key prefix for TTL-backed async task status records
pub const TASK_KEY_PREFIX: &str = "task:";

/// Key prefix for durable batch job records
pub const JOB_KEY_PREFIX: &str = "job:";

/// Default stream name used to derive event subjects
pub const DEFAULT_STREAM_NAME: &str = "fleet_events";

/// Queue carrying dispatched work items for asynchronous execution
pub const WORK_QUEUE_NAME: &str = "fleet_work_items";

/// Default queue group shared by all process instances of a deployment
pub const DEFAULT_QUEUE_GROUP: &str = "fleet_workers";

/// Task status records self-expire after this many seconds (24 hours)
pub const DEFAULT_TASK_RECORD_TTL_SECS: u64 = 24 * 60 * 60;

/// Locks expire after this many seconds if the holder crashes without releasing
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30 * 60;

/// Gate tickets expire after this many seconds if the holder crashes
pub const DEFAULT_GATE_TTL_SECS: u64 = 5 * 60;

/// Messages delivered more than this many times are dropped as poison
pub const DEFAULT_MAX_DELIVERY: u32 = 10;

/// In-progress jobs with no progress update for this many seconds are stale
pub const DEFAULT_STALE_JOB_THRESHOLD_SECS: u64 = 60 * 60;
