//! # Event Bus Consumer
//!
//! ## Overview
//!
//! Durable, queue-grouped consumption of fleet events. Each event type maps
//! to one backend queue; every worker instance polls the same queues, so the
//! backend's visibility leases spread messages across the fleet with each
//! message going to exactly one instance at a time.
//!
//! ## Delivery Semantics
//!
//! At-least-once. A message is acked only when every registered handler for
//! its event type succeeds within the handler timeout; any failure or
//! timeout naks the message for redelivery. Messages that exceed the
//! delivery ceiling are archived out of rotation with an error log so one
//! poison payload cannot wedge its queue.

pub mod handler;
pub mod registry;

pub use handler::{EventHandler, HandlerError, HandlerOutcome};
pub use registry::{HandlerRegistry, RegistryError};

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::error::Result;
use crate::messaging::{EventEnvelope, EventQueue, EventType, QueueMessage};

/// Consumer tuning derived from the process configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream_name: String,
    /// Queue group identity shared by all instances of a deployment; the
    /// queue backend does the balancing, this is logged for operators
    pub queue_group: String,
    pub visibility_timeout: Duration,
    pub handler_timeout: Duration,
    pub max_delivery: u32,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl ConsumerConfig {
    pub fn from_fleet_config(config: &FleetConfig) -> Self {
        Self {
            stream_name: config.stream_name.clone(),
            queue_group: config.queue_group.clone(),
            visibility_timeout: config.visibility_timeout(),
            handler_timeout: config.handler_timeout(),
            max_delivery: config.max_delivery,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Polls event queues and dispatches envelopes to registered handlers
pub struct EventConsumer {
    queue: Arc<dyn EventQueue>,
    registry: Arc<HandlerRegistry>,
    config: ConsumerConfig,
    shutdown: AtomicBool,
}

impl EventConsumer {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        registry: Arc<HandlerRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Create queues for every event type with a registered handler.
    /// Queue creation is idempotent, so instances racing at startup is fine.
    pub async fn subscribe_all(&self) -> Result<()> {
        let types = self.registry.registered_types();
        if types.is_empty() {
            warn!("No event handlers registered; consumer will be idle");
        }
        for event_type in &types {
            let queue_name = event_type.queue_name(&self.config.stream_name);
            self.queue.create_queue(&queue_name).await?;
            info!(
                event_type = %event_type,
                queue_name = %queue_name,
                "Subscribed to event queue"
            );
        }
        Ok(())
    }

    /// Drain one batch from the queue for a single event type; returns the
    /// number of messages processed
    pub async fn poll_once(&self, event_type: EventType) -> Result<usize> {
        let queue_name = event_type.queue_name(&self.config.stream_name);
        let messages = self
            .queue
            .read(
                &queue_name,
                self.config.visibility_timeout,
                self.config.batch_size,
            )
            .await?;

        let count = messages.len();
        for message in messages {
            self.process_message(event_type, &queue_name, message).await;
        }
        Ok(count)
    }

    /// Poll all registered event types until [`stop`](Self::stop) is called
    pub async fn run(&self) -> Result<()> {
        self.subscribe_all().await?;
        let types = self.registry.registered_types();
        info!(
            event_types = types.len(),
            queue_group = %self.config.queue_group,
            "Event consumer started"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            let mut processed = 0usize;
            for event_type in &types {
                match self.poll_once(*event_type).await {
                    Ok(n) => processed += n,
                    Err(e) => {
                        error!(event_type = %event_type, error = %e, "Poll failed");
                    }
                }
            }
            if processed == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        info!("Event consumer stopped");
        Ok(())
    }

    /// Request cooperative shutdown of [`run`](Self::run)
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Process one leased message end to end. Transport failures on the
    /// final ack/nak are logged, not retried; the visibility timeout covers
    /// a lost ack with a redelivery.
    async fn process_message(
        &self,
        event_type: EventType,
        queue_name: &str,
        message: QueueMessage,
    ) {
        if message.read_ct > self.config.max_delivery {
            error!(
                queue_name = queue_name,
                msg_id = message.msg_id,
                delivery_count = message.read_ct,
                max_delivery = self.config.max_delivery,
                "Delivery ceiling exceeded; archiving message"
            );
            if let Err(e) = self.queue.archive(queue_name, message.msg_id).await {
                error!(
                    queue_name = queue_name,
                    msg_id = message.msg_id,
                    error = %e,
                    "Failed to archive poison message"
                );
            }
            return;
        }

        let envelope: EventEnvelope = match serde_json::from_value(message.payload.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue_name = queue_name,
                    msg_id = message.msg_id,
                    delivery_count = message.read_ct,
                    error = %e,
                    "Undecodable envelope; releasing for redelivery"
                );
                self.nak_logged(queue_name, message.msg_id).await;
                return;
            }
        };

        // Publisher trace context rides along on every processing log so an
        // event can be correlated back to the request that produced it
        let trace = envelope.trace_context();
        let trace = trace.as_deref().unwrap_or("");

        let outcomes = self.dispatch(event_type, &envelope).await;
        let all_succeeded = outcomes.iter().all(|(_, o)| o.is_success());

        for (handler_name, outcome) in &outcomes {
            match outcome {
                HandlerOutcome::Success => {}
                HandlerOutcome::Failed(reason) => {
                    warn!(
                        event_id = %envelope.event_id,
                        event_type = %event_type,
                        handler = handler_name.as_str(),
                        delivery_count = message.read_ct,
                        reason = reason.as_str(),
                        trace = trace,
                        "Handler failed"
                    );
                }
                HandlerOutcome::TimedOut => {
                    warn!(
                        event_id = %envelope.event_id,
                        event_type = %event_type,
                        handler = handler_name.as_str(),
                        delivery_count = message.read_ct,
                        timeout_ms = self.config.handler_timeout.as_millis() as u64,
                        trace = trace,
                        "Handler timed out"
                    );
                }
            }
        }

        if all_succeeded {
            debug!(
                event_id = %envelope.event_id,
                event_type = %event_type,
                handlers = outcomes.len(),
                trace = trace,
                "Event processed"
            );
            if let Err(e) = self.queue.ack(queue_name, message.msg_id).await {
                error!(
                    queue_name = queue_name,
                    msg_id = message.msg_id,
                    error = %e,
                    "Failed to ack processed message"
                );
            }
        } else {
            self.nak_logged(queue_name, message.msg_id).await;
        }
    }

    /// Run every handler for the event type concurrently, each under the
    /// handler timeout
    async fn dispatch(
        &self,
        event_type: EventType,
        envelope: &EventEnvelope,
    ) -> Vec<(String, HandlerOutcome)> {
        let handlers = self.registry.handlers_for(event_type);
        let invocations = handlers.iter().map(|handler| {
            let handler = Arc::clone(handler);
            async move {
                let name = handler.name().to_string();
                let outcome =
                    match tokio::time::timeout(self.config.handler_timeout, handler.handle(envelope))
                        .await
                    {
                        Ok(Ok(())) => HandlerOutcome::Success,
                        Ok(Err(e)) => HandlerOutcome::Failed(e.to_string()),
                        Err(_) => HandlerOutcome::TimedOut,
                    };
                (name, outcome)
            }
        });
        join_all(invocations).await
    }

    async fn nak_logged(&self, queue_name: &str, msg_id: i64) {
        if let Err(e) = self.queue.nak(queue_name, msg_id).await {
            error!(
                queue_name = queue_name,
                msg_id = msg_id,
                error = %e,
                "Failed to nak message"
            );
        }
    }
}
