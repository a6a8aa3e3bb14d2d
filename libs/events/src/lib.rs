//! # edgeplace-events
//!
//! Event vocabulary for the edgeplace orchestrator.
//!
//! Every observable transition in the system (a catalog upload, a replication
//! ack or failure, a claim, a task launch, completion or resource-version
//! notification) is published as an [`Event`]: an [`EventEnvelope`] around an
//! [`EventPayload`].
//!
//! ## Event Envelope
//!
//! All events share:
//! - Process-local ordering (`event_id`)
//! - The node that emitted the event (`origin_node`)
//! - The aggregate the event is about (`aggregate_kind`, `aggregate_id`)
//!
//! ## Event Types
//!
//! - Resource events (`resource.*`)
//! - Request events (`request.*`, `discovery.*`)
//! - Task events (`task.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;

/// The envelope type published on the orchestrator's event bus.
pub type Event = EventEnvelope<EventPayload>;
