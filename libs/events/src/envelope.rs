//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use edgeplace_id::EventId;
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    /// A catalog entry, identified by `{node_id}/{resource_id}`.
    #[default]
    Resource,
    /// A client request, identified by the request string.
    Request,
    /// A launched workload, identified by its task ID.
    Task,
}

impl std::fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateKind::Resource => "resource",
            AggregateKind::Request => "request",
            AggregateKind::Task => "task",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Process-local monotonic event identifier.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Node that emitted the event.
    pub origin_node: String,

    /// The kind of aggregate this event belongs to.
    pub aggregate_kind: AggregateKind,

    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The event type (e.g., "resource.uploaded", "task.completed").
    pub event_type: String,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Encodes the envelope as a single JSON line.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<P: for<'de> Deserialize<'de>> EventEnvelope<P> {
    /// Decodes an envelope previously produced by [`EventEnvelope::to_json`].
    pub fn from_json(s: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    origin_node: Option<String>,
    aggregate_kind: Option<AggregateKind>,
    aggregate_id: Option<String>,
    event_type: Option<String>,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            origin_node: None,
            aggregate_kind: None,
            aggregate_id: None,
            event_type: None,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn origin_node(mut self, node_id: impl Into<String>) -> Self {
        self.origin_node = Some(node_id.into());
        self
    }

    pub fn aggregate(mut self, kind: AggregateKind, id: impl Into<String>) -> Self {
        self.aggregate_kind = Some(kind);
        self.aggregate_id = Some(id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope. `occurred_at` defaults to now.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            origin_node: self
                .origin_node
                .ok_or(EventError::MissingField("origin_node"))?,
            aggregate_kind: self
                .aggregate_kind
                .ok_or(EventError::MissingField("aggregate_kind"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventError::MissingField("aggregate_id"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
