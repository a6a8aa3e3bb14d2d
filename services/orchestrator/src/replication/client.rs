//! Broadcasting catalog updates to peers.

use std::time::{Duration, Instant};

use edgeplace_events::{
    EventPayload, ResourcePropagatedPayload, ResourceReplicatedPayload,
    ResourceReplicationFailedPayload,
};
use edgeplace_id::BroadcastId;
use edgeplace_proto::replication::v1::{ReplicateUpdateRequest, ReplicationClient};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tonic::transport::Endpoint;
use tracing::{debug, info, instrument, warn};

use super::ReplicationError;
use crate::backoff::BackoffPolicy;
use crate::catalog::ResourceRecord;
use crate::events::EventBus;

/// Default per-call timeout for dialing and acknowledgment.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Default attempts per peer.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// A peer that acknowledged the update.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAck {
    pub peer: String,
    pub attempts: u32,
    pub message: String,
}

/// A peer that never acknowledged the update.
#[derive(Debug)]
pub struct PeerFailure {
    pub peer: String,
    pub attempts: u32,
    pub error: ReplicationError,
}

/// Time from a local upload to the first peer acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationMeasurement {
    pub resource_id: String,
    pub node_id: String,
    pub first_peer: String,
    pub elapsed: Duration,
}

/// Per-peer outcome of one broadcast.
#[derive(Debug)]
pub struct BroadcastReport {
    pub broadcast_id: BroadcastId,
    pub acked: Vec<PeerAck>,
    pub failures: Vec<PeerFailure>,
    /// Present when at least one peer acknowledged.
    pub propagation: Option<PropagationMeasurement>,
}

impl BroadcastReport {
    /// True when every peer acknowledged.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pushes uploaded records to every configured peer.
#[derive(Clone)]
pub struct Broadcaster {
    peers: Vec<String>,
    timeout: Duration,
    attempts: u32,
    backoff: BackoffPolicy,
    events: EventBus,
}

impl Broadcaster {
    pub fn new(peers: Vec<String>, events: EventBus) -> Self {
        Self {
            peers: peers.into_iter().map(|p| normalize_peer(&p)).collect(),
            timeout: DEFAULT_RPC_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            events,
        }
    }

    /// Set the dial and acknowledgment timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the attempts per peer (at least one).
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the delay policy between attempts.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Send `record` to every peer concurrently.
    ///
    /// `uploaded_at` is when the record was uploaded locally; the first
    /// acknowledgment is measured against it. Never touches the catalog.
    #[instrument(skip(self, record, uploaded_at), fields(resource_id = %record.resource_id, node_id = %record.node_id))]
    pub async fn broadcast(&self, record: &ResourceRecord, uploaded_at: Instant) -> BroadcastReport {
        let broadcast_id = BroadcastId::new();
        let request = ReplicateUpdateRequest {
            resource_id: record.resource_id.clone(),
            node_id: record.node_id.clone(),
        };

        let mut report = BroadcastReport {
            broadcast_id,
            acked: Vec::new(),
            failures: Vec::new(),
            propagation: None,
        };

        let mut pending: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|peer| self.replicate_to(peer, &request))
            .collect();

        while let Some(result) = pending.next().await {
            match result {
                Ok(ack) => {
                    if report.propagation.is_none() {
                        let measurement = PropagationMeasurement {
                            resource_id: record.resource_id.clone(),
                            node_id: record.node_id.clone(),
                            first_peer: ack.peer.clone(),
                            elapsed: uploaded_at.elapsed(),
                        };
                        info!(
                            %broadcast_id,
                            first_peer = %measurement.first_peer,
                            elapsed_ms = measurement.elapsed.as_millis() as u64,
                            "Update propagated"
                        );
                        self.events
                            .publish(EventPayload::ResourcePropagated(ResourcePropagatedPayload {
                                broadcast_id,
                                resource_id: measurement.resource_id.clone(),
                                node_id: measurement.node_id.clone(),
                                first_peer: measurement.first_peer.clone(),
                                elapsed_ms: measurement.elapsed.as_millis() as u64,
                            }));
                        report.propagation = Some(measurement);
                    }

                    self.events
                        .publish(EventPayload::ResourceReplicated(ResourceReplicatedPayload {
                            broadcast_id,
                            resource_id: record.resource_id.clone(),
                            node_id: record.node_id.clone(),
                            peer: ack.peer.clone(),
                            attempts: ack.attempts,
                            ack: ack.message.clone(),
                        }));
                    report.acked.push(ack);
                }
                Err(failure) => {
                    warn!(
                        %broadcast_id,
                        peer = %failure.peer,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Replication to peer failed"
                    );
                    self.events.publish(EventPayload::ResourceReplicationFailed(
                        ResourceReplicationFailedPayload {
                            broadcast_id,
                            resource_id: record.resource_id.clone(),
                            node_id: record.node_id.clone(),
                            peer: failure.peer.clone(),
                            attempts: failure.attempts,
                            reason: failure.error.to_string(),
                        },
                    ));
                    report.failures.push(failure);
                }
            }
        }

        debug!(
            %broadcast_id,
            acked = report.acked.len(),
            failed = report.failures.len(),
            "Broadcast finished"
        );
        report
    }

    /// Deliver to one peer, retrying with backoff.
    async fn replicate_to(
        &self,
        peer: &str,
        request: &ReplicateUpdateRequest,
    ) -> Result<PeerAck, PeerFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(peer, request).await {
                Ok(message) => {
                    return Ok(PeerAck {
                        peer: peer.to_string(),
                        attempts: attempt,
                        message,
                    })
                }
                Err(error) if attempt < self.attempts && error.is_retryable() => {
                    let delay = self.backoff.delay(attempt - 1);
                    debug!(peer, attempt, ?delay, error = %error, "Retrying replication");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(PeerFailure {
                        peer: peer.to_string(),
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }

    async fn send_once(
        &self,
        peer: &str,
        request: &ReplicateUpdateRequest,
    ) -> Result<String, ReplicationError> {
        let endpoint = Endpoint::from_shared(peer.to_string())
            .map_err(|source| ReplicationError::InvalidEndpoint {
                peer: peer.to_string(),
                source,
            })?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        let channel = tokio::time::timeout(self.timeout, endpoint.connect())
            .await
            .map_err(|_| ReplicationError::Timeout {
                peer: peer.to_string(),
                after: self.timeout,
            })?
            .map_err(|source| ReplicationError::Connect {
                peer: peer.to_string(),
                source,
            })?;

        let mut client = ReplicationClient::new(channel);
        let response = tokio::time::timeout(self.timeout, client.replicate_update(request.clone()))
            .await
            .map_err(|_| ReplicationError::Timeout {
                peer: peer.to_string(),
                after: self.timeout,
            })?
            .map_err(|status| ReplicationError::Rpc {
                peer: peer.to_string(),
                status,
            })?;

        Ok(response.into_inner().message)
    }
}

/// Peers may be configured as bare `host:port`; tonic needs a URI.
fn normalize_peer(peer: &str) -> String {
    let peer = peer.trim();
    if peer.contains("://") {
        peer.to_string()
    } else {
        format!("http://{peer}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResourceCatalog;

    #[test]
    fn test_normalize_peer() {
        assert_eq!(normalize_peer("10.0.0.2:50051"), "http://10.0.0.2:50051");
        assert_eq!(normalize_peer(" http://peer:1 "), "http://peer:1");
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let catalog = ResourceCatalog::new();
        let record = catalog.upload("r1", "n1").unwrap();
        let broadcaster = Broadcaster::new(Vec::new(), EventBus::new("n1", 16));

        let report = broadcaster.broadcast(&record, Instant::now()).await;
        assert!(report.is_complete());
        assert!(report.acked.is_empty());
        assert!(report.propagation.is_none());
    }

    #[tokio::test]
    async fn test_invalid_peer_is_not_retried() {
        let catalog = ResourceCatalog::new();
        let record = catalog.upload("r1", "n1").unwrap();
        let broadcaster = Broadcaster::new(vec!["http://bad peer".to_string()], EventBus::new("n1", 16))
            .with_attempts(5);

        let report = broadcaster.broadcast(&record, Instant::now()).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 1);
        assert!(matches!(
            report.failures[0].error,
            ReplicationError::InvalidEndpoint { .. }
        ));
    }
}
