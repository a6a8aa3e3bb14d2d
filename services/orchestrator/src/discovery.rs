//! Resource discovery.
//!
//! Turns a resolved request into a placement decision by claiming an
//! available catalog record for the resource the request needs. The claim is
//! a single atomic catalog operation, so concurrent discoveries for the same
//! resource never both win the same record.

use std::sync::Arc;
use std::time::Instant;

use edgeplace_events::{DiscoveryMissedPayload, EventPayload, ResourceClaimedPayload};
use tracing::{debug, info, instrument};

use crate::catalog::ResourceCatalog;
use crate::events::EventBus;
use crate::lookup::ResolvedRequest;

/// Placement decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    pub request: String,
    pub application_to_launch: String,
    pub resource_id: String,
    /// Node holding the claimed resource; `None` when nothing was available.
    pub target_node: Option<String>,
    /// Catalog revision observed when the resource was claimed.
    pub claimed_revision: u64,
    /// When the request entered the pipeline.
    pub received_at: Instant,
}

impl DiscoveryResult {
    /// True when no available record matched the request's resource.
    pub fn is_miss(&self) -> bool {
        self.target_node.is_none()
    }

    /// Target node, or the empty string for a miss.
    pub fn target_node_or_empty(&self) -> &str {
        self.target_node.as_deref().unwrap_or("")
    }
}

/// Claims catalog records on behalf of resolved requests.
#[derive(Clone)]
pub struct DiscoveryEngine {
    catalog: Arc<ResourceCatalog>,
    events: EventBus,
}

impl DiscoveryEngine {
    pub fn new(catalog: Arc<ResourceCatalog>, events: EventBus) -> Self {
        Self { catalog, events }
    }

    /// Claim an available record for `request.resource_id`.
    #[instrument(skip(self, request), fields(request = %request.request, resource_id = %request.resource_id))]
    pub fn discover(&self, request: &ResolvedRequest) -> DiscoveryResult {
        let claim = self.catalog.find_and_claim(&request.resource_id);

        let (target_node, claimed_revision) = match claim {
            Some(claim) => {
                info!(target_node = %claim.record.node_id, "Resource claimed");
                self.events
                    .publish(EventPayload::ResourceClaimed(ResourceClaimedPayload {
                        request: request.request.clone(),
                        resource_id: claim.record.resource_id.clone(),
                        node_id: claim.record.node_id.clone(),
                    }));
                (Some(claim.record.node_id), claim.observed_revision)
            }
            None => {
                debug!("No available record for resource");
                self.events
                    .publish(EventPayload::DiscoveryMissed(DiscoveryMissedPayload {
                        request: request.request.clone(),
                        application: request.application.clone(),
                        resource_id: request.resource_id.clone(),
                    }));
                (None, self.catalog.revision())
            }
        };

        DiscoveryResult {
            request: request.request.clone(),
            application_to_launch: request.application.clone(),
            resource_id: request.resource_id.clone(),
            target_node,
            claimed_revision,
            received_at: request.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use edgeplace_events::event_types;

    use super::*;
    use crate::catalog::ResourceStatus;
    use crate::lookup::LookupTables;

    fn setup() -> (Arc<ResourceCatalog>, DiscoveryEngine, LookupTables) {
        let catalog = Arc::new(ResourceCatalog::new());
        let engine = DiscoveryEngine::new(Arc::clone(&catalog), EventBus::new("n1", 64));
        let mut tables = LookupTables::empty();
        tables.insert("req1", "a1", "r1");
        tables.insert("req2", "a2", "r1");
        (catalog, engine, tables)
    }

    #[test]
    fn test_discover_claims_and_then_misses() {
        let (catalog, engine, tables) = setup();
        catalog.upload("r1", "n1").unwrap();

        let first = engine.discover(&tables.resolve("req1").unwrap());
        assert_eq!(first.target_node.as_deref(), Some("n1"));
        assert_eq!(first.application_to_launch, "a1");
        assert_eq!(catalog.get("n1", "r1").unwrap().status, ResourceStatus::Used);

        let second = engine.discover(&tables.resolve("req2").unwrap());
        assert!(second.is_miss());
        assert_eq!(second.target_node_or_empty(), "");
    }

    #[test]
    fn test_discover_publishes_outcome_events() {
        let (catalog, engine, tables) = setup();
        let mut rx = engine.events.subscribe();
        catalog.upload("r1", "n1").unwrap();

        engine.discover(&tables.resolve("req1").unwrap());
        engine.discover(&tables.resolve("req2").unwrap());

        assert_eq!(rx.try_recv().unwrap().event_type, event_types::RESOURCE_CLAIMED);
        assert_eq!(rx.try_recv().unwrap().event_type, event_types::DISCOVERY_MISSED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_discovery_claims_once() {
        let (catalog, engine, tables) = setup();
        catalog.upload("r1", "n1").unwrap();

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let engine = engine.clone();
                let request = tables
                    .resolve(if i % 2 == 0 { "req1" } else { "req2" })
                    .unwrap();
                tokio::spawn(async move { engine.discover(&request) })
            })
            .collect();

        let mut placed = 0;
        for handle in handles {
            if !handle.await.unwrap().is_miss() {
                placed += 1;
            }
        }
        assert_eq!(placed, 1);
    }
}
