//! End-to-end consumer behavior: fan-out, competing instances, redelivery
//! after a handler failure, and poison archival.

use async_trait::async_trait;
use fleet_core::consumer::{
    ConsumerConfig, EventConsumer, EventHandler, HandlerError, HandlerRegistry,
};
use fleet_core::messaging::{EventEnvelope, EventQueue, EventType, InMemoryQueue};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config() -> ConsumerConfig {
    ConsumerConfig {
        stream_name: "itest_events".to_string(),
        queue_group: "itest_workers".to_string(),
        visibility_timeout: Duration::from_millis(200),
        handler_timeout: Duration::from_millis(200),
        max_delivery: 10,
        batch_size: 10,
        poll_interval: Duration::from_millis(5),
    }
}

async fn publish(queue: &InMemoryQueue, config: &ConsumerConfig, envelope: &EventEnvelope) {
    let queue_name = envelope.event_type.queue_name(&config.stream_name);
    queue
        .send(&queue_name, &serde_json::to_value(envelope).unwrap())
        .await
        .unwrap();
}

/// Records every event id it sees; optionally fails one event id once
struct RecordingHandler {
    name: &'static str,
    seen: Mutex<Vec<String>>,
    fail_once_for: Option<String>,
    failures_left: AtomicU32,
}

impl RecordingHandler {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            seen: Mutex::new(Vec::new()),
            fail_once_for: None,
            failures_left: AtomicU32::new(0),
        })
    }

    fn failing_once_for(name: &'static str, event_id: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            seen: Mutex::new(Vec::new()),
            fail_once_for: Some(event_id),
            failures_left: AtomicU32::new(1),
        })
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if let Some(target) = &self.fail_once_for {
            if envelope.event_id == *target
                && self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(HandlerError::new("injected failure"));
            }
        }
        self.seen.lock().unwrap().push(envelope.event_id.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        self.name
    }
}

#[tokio::test]
async fn ten_events_fan_out_to_two_handlers_with_one_injected_failure() {
    let queue = Arc::new(InMemoryQueue::new());
    let config = config();

    let envelopes: Vec<EventEnvelope> = (0..10)
        .map(|n| EventEnvelope::new(EventType::ContentIngested, json!({"n": n})))
        .collect();
    let failing_id = envelopes[6].event_id.clone();

    let handler_a = RecordingHandler::new("handler_a");
    let handler_b = RecordingHandler::failing_once_for("handler_b", failing_id.clone());

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::ContentIngested, handler_a.clone())
        .unwrap();
    registry
        .register(EventType::ContentIngested, handler_b.clone())
        .unwrap();

    // Two consumer instances share the queue and the registry, competing
    // for messages the way two worker processes would
    let registry = Arc::new(registry);
    let consumer_one = EventConsumer::new(queue.clone(), registry.clone(), config.clone());
    let consumer_two = EventConsumer::new(queue.clone(), registry, config.clone());
    consumer_one.subscribe_all().await.unwrap();

    for envelope in &envelopes {
        publish(&queue, &config, envelope).await;
    }

    // Drain until the queue is empty; the failed message needs one extra
    // delivery
    let queue_name = EventType::ContentIngested.queue_name(&config.stream_name);
    for _ in 0..20 {
        consumer_one.poll_once(EventType::ContentIngested).await.unwrap();
        consumer_two.poll_once(EventType::ContentIngested).await.unwrap();
        if queue.queue_depth(&queue_name).await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.queue_depth(&queue_name).await.unwrap(), 0);

    // Handler A saw the failing event twice (handler B's failure naks the
    // whole message), everything else exactly once across both instances
    let seen_a = handler_a.seen.lock().unwrap().clone();
    for envelope in &envelopes {
        let count = seen_a.iter().filter(|id| **id == envelope.event_id).count();
        if envelope.event_id == failing_id {
            assert_eq!(count, 2, "failed event redelivered to handler A");
        } else {
            assert_eq!(count, 1, "event {} delivered once", envelope.event_id);
        }
    }

    // Handler B eventually processed all ten, including the one it failed
    let seen_b = handler_b.seen.lock().unwrap().clone();
    assert_eq!(seen_b.len(), 10);
    assert!(seen_b.contains(&failing_id));
}

#[tokio::test]
async fn unacked_message_returns_after_visibility_timeout() {
    let queue = Arc::new(InMemoryQueue::new());
    let config = config();

    struct CrashingOnce {
        crashed: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for CrashingOnce {
        async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
            if self.crashed.fetch_add(1, Ordering::SeqCst) == 0 {
                // Simulates a worker that takes too long and loses its lease
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(())
        }
        fn name(&self) -> &str {
            "crashing_once"
        }
    }

    let handler = Arc::new(CrashingOnce {
        crashed: AtomicU32::new(0),
    });
    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::RechunkRequested, handler.clone())
        .unwrap();

    let consumer = EventConsumer::new(queue.clone(), Arc::new(registry), config.clone());
    consumer.subscribe_all().await.unwrap();

    let envelope = EventEnvelope::new(EventType::RechunkRequested, json!({}));
    publish(&queue, &config, &envelope).await;

    // First poll times out the handler and naks
    consumer.poll_once(EventType::RechunkRequested).await.unwrap();
    // Second poll succeeds
    consumer.poll_once(EventType::RechunkRequested).await.unwrap();

    let queue_name = EventType::RechunkRequested.queue_name(&config.stream_name);
    assert_eq!(queue.queue_depth(&queue_name).await.unwrap(), 0);
    assert_eq!(handler.crashed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn consumer_run_loop_stops_on_request() {
    let queue = Arc::new(InMemoryQueue::new());
    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::DigestRequested, RecordingHandler::new("digest"))
        .unwrap();

    let consumer = Arc::new(EventConsumer::new(
        queue,
        Arc::new(registry),
        config(),
    ));

    let running = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    consumer.stop();

    let result = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("run loop should exit after stop");
    assert!(result.unwrap().is_ok());
}
