//! # Handler Registry
//!
//! Maps event types to the handlers that should run for them. Registration
//! is explicit and duplicate-safe: registering the same handler name twice
//! for one event type is rejected so a misconfigured bootstrap cannot
//! silently double-process events.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::handler::EventHandler;
use crate::messaging::EventType;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Handler '{handler}' is already registered for event type '{event_type}'")]
    DuplicateHandler {
        event_type: EventType,
        handler: String,
    },
}

/// Registry of event handlers keyed by event type
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type.
    ///
    /// Multiple distinct handlers per event type are allowed and all of them
    /// run for each delivery. The same handler name twice is an error.
    pub fn register(
        &mut self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RegistryError> {
        let registered = self.handlers.entry(event_type).or_default();
        if registered.iter().any(|h| h.name() == handler.name()) {
            return Err(RegistryError::DuplicateHandler {
                event_type,
                handler: handler.name().to_string(),
            });
        }

        debug!(
            event_type = %event_type,
            handler = handler.name(),
            "Registered event handler"
        );
        registered.push(handler);
        Ok(())
    }

    /// Handlers registered for an event type, in registration order
    pub fn handlers_for(&self, event_type: EventType) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Event types with at least one registered handler
    pub fn registered_types(&self) -> Vec<EventType> {
        self.handlers
            .iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(event_type, _)| *event_type)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: HashMap<String, Vec<&str>> = self
            .handlers
            .iter()
            .map(|(event_type, handlers)| {
                (
                    event_type.to_string(),
                    handlers.iter().map(|h| h.name()).collect(),
                )
            })
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}
