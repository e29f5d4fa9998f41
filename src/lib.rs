//! # Fleet Core
//!
//! Distributed coordination core for stateless worker fleets: durable event
//! consumption, cross-process concurrency gates and locks, batch job
//! tracking, and gated task dispatch, all coordinated through a shared
//! key-value store and a durable message queue.
//!
//! ## Key Components
//!
//! - **Event consumer**: queue-grouped, at-least-once delivery of typed
//!   events to registered handlers ([`consumer`])
//! - **Token gate**: distributed counting semaphore with per-holder TTL
//!   expiry ([`coordination::TokenGate`])
//! - **Lock manager**: non-blocking try-locks with TTL backstop
//!   ([`coordination::LockManager`])
//! - **Batch job tracker**: durable job lifecycle records with staleness
//!   sweeps ([`jobs`])
//! - **Task dispatcher**: explicit work item registry with per-item
//!   concurrency gates ([`tasks`])
//!
//! ## Architecture
//!
//! Every coordination primitive reduces to atomic conditional writes
//! (set-if-absent, compare-and-swap) against a [`store::CoordinationStore`],
//! and every TTL doubles as crash recovery: a worker that dies holding a
//! lock or a gate slot loses it on expiry without any external janitor.

pub mod config;
pub mod constants;
pub mod consumer;
pub mod coordination;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod messaging;
pub mod resilience;
pub mod store;
pub mod tasks;

pub use config::FleetConfig;
pub use consumer::{EventConsumer, EventHandler, HandlerError, HandlerRegistry};
pub use coordination::{GateError, GateTicket, LockManager, TokenGate};
pub use error::{CleanupFailure, FleetError, Result};
pub use jobs::{BatchJob, BatchJobStatus, BatchJobTracker};
pub use messaging::{EventEnvelope, EventQueue, EventType, InMemoryQueue, PgmqQueue};
pub use store::{CoordinationStore, MemoryStore};
pub use tasks::{
    AsyncTask, TaskDispatcher, TaskStatus, TaskStatusTracker, WorkItem, WorkItemRegistry,
};

#[cfg(feature = "store-redis")]
pub use store::RedisStore;
