//! # Event Messaging
//!
//! Wire types and queue backends for the fleet event bus. One queue per
//! event subject; worker instances reading the same queue compete for
//! messages, which gives queue-group load balancing without extra broker
//! state.

pub mod envelope;
pub mod errors;
pub mod memory_queue;
pub mod pgmq_queue;
pub mod queue;

pub use envelope::{EventEnvelope, EventType};
pub use errors::{MessagingError, MessagingResult};
pub use memory_queue::InMemoryQueue;
pub use pgmq_queue::PgmqQueue;
pub use queue::{EventQueue, QueueMessage};
