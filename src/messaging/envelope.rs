//! # Event Types and Envelope
//!
//! The closed set of fleet event types, their wire names, and the JSON
//! envelope every published event travels in. Subjects are derived from the
//! configured stream name so multiple deployments can share one backend
//! without crosstalk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fleet event types carried on the bus.
///
/// Wire names are dotted (`content.ingested`); queue names replace the dots
/// with underscores since the queue backend restricts identifier characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ContentIngested,
    ContentUpdated,
    ContentDeleted,
    RechunkRequested,
    FactCheckRequested,
    DigestRequested,
}

impl EventType {
    /// All known event types, used to pre-create queues at startup
    pub const ALL: [EventType; 6] = [
        EventType::ContentIngested,
        EventType::ContentUpdated,
        EventType::ContentDeleted,
        EventType::RechunkRequested,
        EventType::FactCheckRequested,
        EventType::DigestRequested,
    ];

    /// Dotted wire name as it appears in published envelopes
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventType::ContentIngested => "content.ingested",
            EventType::ContentUpdated => "content.updated",
            EventType::ContentDeleted => "content.deleted",
            EventType::RechunkRequested => "rechunk.requested",
            EventType::FactCheckRequested => "fact_check.requested",
            EventType::DigestRequested => "digest.requested",
        }
    }

    /// Fully qualified subject under the given stream
    pub fn subject(&self, stream_name: &str) -> String {
        format!("{stream_name}.{}", self.wire_name())
    }

    /// Backend queue name for this event type under the given stream
    pub fn queue_name(&self, stream_name: &str) -> String {
        self.subject(stream_name).replace('.', "_")
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content.ingested" => Ok(EventType::ContentIngested),
            "content.updated" => Ok(EventType::ContentUpdated),
            "content.deleted" => Ok(EventType::ContentDeleted),
            "rechunk.requested" => Ok(EventType::RechunkRequested),
            "fact_check.requested" => Ok(EventType::FactCheckRequested),
            "digest.requested" => Ok(EventType::DigestRequested),
            _ => Err(format!("Unknown event type: {s}")),
        }
    }
}

/// Envelope wrapping every event published to the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id for correlating one event across consumers and logs
    pub event_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
    /// Trace context propagated from the publisher; absent on old producers
    #[serde(default)]
    pub trace: HashMap<String, String>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            payload,
            published_at: Utc::now(),
            trace: HashMap::new(),
        }
    }

    pub fn with_trace(mut self, trace: HashMap<String, String>) -> Self {
        self.trace = trace;
        self
    }

    /// Compact `key=value` rendering of the trace context for log fields.
    /// Keys are sorted so the output is stable; `None` when the publisher
    /// propagated no context.
    pub fn trace_context(&self) -> Option<String> {
        if self.trace.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = self
            .trace
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        pairs.sort();
        Some(pairs.join(","))
    }
}
