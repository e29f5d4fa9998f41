//! # Structured Error Handling
//!
//! Top-level error type for the coordination core, plus the cleanup-failure
//! wrapper used on paths where a best-effort cleanup (releasing a lock after a
//! downstream failure) must never mask the error being propagated.

use thiserror::Error;

/// Top-level error type spanning all coordination components
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] crate::messaging::MessagingError),

    #[error("Gate error: {0}")]
    Gate(#[from] crate::coordination::GateError),

    #[error("Job error: {0}")]
    Job(#[from] crate::jobs::JobError),

    #[error("Task lookup error: {0}")]
    TaskLookup(#[from] crate::tasks::TaskLookupError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] crate::tasks::DispatchError),

    #[error("Registry error: {0}")]
    Registry(#[from] crate::consumer::RegistryError),

    /// A coordination conflict: the requested operation is already running.
    /// Surfaced to the caller, never retried automatically.
    #[error("Operation already in progress: {resource}")]
    Conflict { resource: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Cleanup(Box<CleanupFailure>),
}

impl FleetError {
    /// Create a conflict error for a resource that is already being operated on
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, FleetError>;

/// Carries a primary error together with an optional secondary cleanup
/// failure. Display shows only the primary error: cleanup failures are
/// reported separately and never replace the error that caused them.
#[derive(Debug, Error)]
#[error("{primary}")]
pub struct CleanupFailure {
    pub primary: Box<FleetError>,
    pub cleanup_error: Option<String>,
}

impl CleanupFailure {
    /// Wrap a primary error with no cleanup failure recorded
    pub fn new(primary: FleetError) -> Self {
        Self {
            primary: Box::new(primary),
            cleanup_error: None,
        }
    }

    /// Record a cleanup failure that occurred while handling the primary error
    pub fn with_cleanup_error(mut self, error: impl Into<String>) -> Self {
        self.cleanup_error = Some(error.into());
        self
    }
}

impl From<CleanupFailure> for FleetError {
    fn from(failure: CleanupFailure) -> Self {
        FleetError::Cleanup(Box::new(failure))
    }
}
