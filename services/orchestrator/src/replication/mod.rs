//! Inter-node catalog replication.
//!
//! A resource uploaded at one node is pushed to every configured peer with a
//! `ReplicateUpdate` RPC. Peers apply the update to their own catalog and
//! acknowledge; they never forward it, so an update travels exactly one hop
//! from the node where it was uploaded.
//!
//! - [`server`]: the `Replication` gRPC handler and the listener loop
//! - [`client`]: the [`Broadcaster`] that fans an update out to all peers

pub mod client;
pub mod server;

use std::time::Duration;

use thiserror::Error;

pub use client::{BroadcastReport, Broadcaster, PeerAck, PeerFailure, PropagationMeasurement};
pub use server::{serve, serve_with_listener, ReplicationService};

/// Errors replicating an update to one peer.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The peer address is not a valid endpoint URI.
    #[error("invalid peer address '{peer}': {source}")]
    InvalidEndpoint {
        peer: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// The peer could not be dialed.
    #[error("failed to connect to {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// The peer answered with an error status.
    #[error("{peer} rejected update: {status}")]
    Rpc {
        peer: String,
        #[source]
        status: tonic::Status,
    },

    /// No acknowledgment within the timeout.
    #[error("{peer} did not acknowledge within {after:?}")]
    Timeout { peer: String, after: Duration },
}

impl ReplicationError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::InvalidEndpoint { .. } => false,
            ReplicationError::Rpc { status, .. } => {
                status.code() != tonic::Code::InvalidArgument
            }
            ReplicationError::Connect { .. } | ReplicationError::Timeout { .. } => true,
        }
    }
}
