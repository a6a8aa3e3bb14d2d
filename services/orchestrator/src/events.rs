//! Event bus for orchestrator notifications.
//!
//! Components publish typed payloads; the bus stamps them with an envelope,
//! logs them, and fans them out to any subscribers (tests, operator tooling).
//! Publishing never blocks and never fails when nobody is listening.

use std::sync::Arc;

use edgeplace_events::{Event, EventEnvelope, EventPayload};
use edgeplace_id::EventIdSequence;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Cloneable handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    node_id: Arc<str>,
    sequence: Arc<EventIdSequence>,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus for events originating at `node_id`.
    pub fn new(node_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            node_id: Arc::from(node_id.into()),
            sequence: Arc::new(EventIdSequence::new()),
            tx,
        }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Node this bus stamps as the event origin.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish a payload.
    pub fn publish(&self, payload: EventPayload) {
        let (kind, aggregate_id) = payload.aggregate();
        let event_type = payload.event_type();

        let event = match EventEnvelope::builder()
            .event_id(self.sequence.next_id())
            .origin_node(self.node_id.as_ref())
            .aggregate(kind, aggregate_id)
            .event_type(event_type)
            .payload(payload)
            .build()
        {
            Ok(event) => event,
            Err(e) => {
                warn!(event_type, error = %e, "Dropping malformed event");
                return;
            }
        };

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_kind = %event.aggregate_kind,
            aggregate_id = %event.aggregate_id,
            "Event published"
        );

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use edgeplace_events::{event_types, ResourceUploadedPayload};

    use super::*;

    fn uploaded(resource: &str) -> EventPayload {
        EventPayload::ResourceUploaded(ResourceUploadedPayload {
            resource_id: resource.to_string(),
            node_id: "n1".to_string(),
            revision: 1,
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new("n1", 16);
        let mut rx = bus.subscribe();

        bus.publish(uploaded("r1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, event_types::RESOURCE_UPLOADED);
        assert_eq!(event.origin_node, "n1");
        assert_eq!(event.aggregate_id, "n1/r1");
        assert_eq!(event.event_id.value(), 1);
    }

    #[tokio::test]
    async fn test_event_ids_increase() {
        let bus = EventBus::new("n1", 16);
        let mut rx = bus.subscribe();

        bus.publish(uploaded("r1"));
        bus.publish(uploaded("r2"));

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert!(b.event_id > a.event_id);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new("n1", 16);
        bus.publish(uploaded("r1"));
    }
}
