//! # Coordination Primitives
//!
//! Cross-process concurrency control over the shared store: non-blocking
//! exclusive locks ([`LockManager`]) and a distributed counting semaphore
//! ([`TokenGate`]) with templated gate names ([`gate_name::resolve`]).

pub mod gate_name;
pub mod lock_manager;
pub mod token_gate;

pub use gate_name::{resolve, ResolvedName};
pub use lock_manager::LockManager;
pub use token_gate::{GateError, GateResult, GateTicket, TokenGate};
