//! Input feeds.
//!
//! Two producers drive the pipeline:
//! - The resource-upload feed: `{"iotresources": [{"Resource": "...", "NodeID": "..."}]}`
//! - The client-request feed: a JSON array of request identifiers
//!
//! Both are read up front and pushed onto the pipeline queues. Requests are
//! spaced by a fixed inter-arrival time.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::pipeline::IncomingRequest;
use crate::shutdown;

/// Errors loading a feed file.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to read feed {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode feed {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One resource uploaded at a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUpload {
    #[serde(rename = "Resource")]
    pub resource_id: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
}

impl ResourceUpload {
    pub fn new(resource_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            node_id: node_id.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResourceFile {
    #[serde(rename = "iotresources", default)]
    resources: Vec<ResourceUpload>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, FeedError> {
    let raw = std::fs::read_to_string(path).map_err(|source| FeedError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| FeedError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the resource-upload feed.
pub fn load_resources(path: impl AsRef<Path>) -> Result<Vec<ResourceUpload>, FeedError> {
    let file: ResourceFile = read_json(path.as_ref())?;
    Ok(file.resources)
}

/// Load the client-request feed.
pub fn load_requests(path: impl AsRef<Path>) -> Result<Vec<String>, FeedError> {
    read_json(path.as_ref())
}

/// Push every upload onto the upload queue in order, after `warmup`.
///
/// Returns the number of uploads delivered before the queue closed or
/// shutdown was signalled.
pub async fn produce_uploads(
    uploads: Vec<ResourceUpload>,
    tx: mpsc::Sender<ResourceUpload>,
    warmup: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    tokio::select! {
        _ = tokio::time::sleep(warmup) => {}
        _ = shutdown::signalled(&mut shutdown) => return 0,
    }

    let mut sent = 0;
    for upload in uploads {
        tokio::select! {
            result = tx.send(upload) => {
                if result.is_err() {
                    break;
                }
                sent += 1;
            }
            _ = shutdown::signalled(&mut shutdown) => break,
        }
    }
    info!(sent, "Resource feed drained");
    sent
}

/// Push requests onto the request queue after `startup_delay`, one every
/// `interval`. Each request is stamped with its pipeline entry time.
pub async fn produce_requests(
    requests: Vec<String>,
    tx: mpsc::Sender<IncomingRequest>,
    startup_delay: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    tokio::select! {
        _ = tokio::time::sleep(startup_delay) => {}
        _ = shutdown::signalled(&mut shutdown) => return 0,
    }

    let mut sent = 0;
    let total = requests.len();
    for (i, name) in requests.into_iter().enumerate() {
        debug!(request = %name, "Submitting client request");
        let request = IncomingRequest {
            name,
            received_at: Instant::now(),
        };
        if tx.send(request).await.is_err() {
            break;
        }
        sent += 1;

        if i + 1 < total {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown::signalled(&mut shutdown) => break,
            }
        }
    }
    info!(sent, "Request feed drained");
    sent
}
