//! Replication gRPC server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use edgeplace_proto::replication::v1::{
    ReplicateUpdateAck, ReplicateUpdateRequest, Replication, ReplicationServer,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::catalog::{ApplyOutcome, CatalogError, ResourceCatalog};
use crate::shutdown;

/// Handles `ReplicateUpdate` calls from peers.
pub struct ReplicationService {
    catalog: Arc<ResourceCatalog>,
}

impl ReplicationService {
    pub fn new(catalog: Arc<ResourceCatalog>) -> Self {
        Self { catalog }
    }
}

#[tonic::async_trait]
impl Replication for ReplicationService {
    async fn replicate_update(
        &self,
        request: Request<ReplicateUpdateRequest>,
    ) -> Result<Response<ReplicateUpdateAck>, Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();

        let outcome = self
            .catalog
            .apply_replicated_update(&req.resource_id, &req.node_id)
            .map_err(|e| match e {
                CatalogError::EmptyIdentifier(_) => Status::invalid_argument(e.to_string()),
                CatalogError::DuplicateRecord { .. } => Status::already_exists(e.to_string()),
            })?;

        let message = match outcome {
            ApplyOutcome::Inserted(record) => {
                info!(
                    resource_id = %record.resource_id,
                    node_id = %record.node_id,
                    revision = record.revision,
                    from = ?remote,
                    "Applied replicated update"
                );
                format!("replicated {} at {}", record.resource_id, record.node_id)
            }
            ApplyOutcome::AlreadyPresent(record) => {
                debug!(
                    resource_id = %record.resource_id,
                    node_id = %record.node_id,
                    from = ?remote,
                    "Replicated update already applied"
                );
                format!("already present {} at {}", record.resource_id, record.node_id)
            }
        };

        Ok(Response::new(ReplicateUpdateAck { message }))
    }
}

/// Bind `addr` and serve replication until `shutdown` flips to true.
///
/// Failing to bind is fatal to the caller.
pub async fn serve(
    addr: SocketAddr,
    catalog: Arc<ResourceCatalog>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind replication listener on {addr}"))?;
    serve_with_listener(listener, catalog, shutdown).await
}

/// Serve replication on an already-bound listener until `shutdown` flips to true.
pub async fn serve_with_listener(
    listener: TcpListener,
    catalog: Arc<ResourceCatalog>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(addr = %local_addr, "Replication server listening");

    tonic::transport::Server::builder()
        .add_service(ReplicationServer::new(ReplicationService::new(catalog)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown::signalled(&mut shutdown).await;
            info!("Replication server shutting down");
        })
        .await
        .context("replication server failed")
}
