//! Replicated resource catalog.
//!
//! The catalog maps each node to the IoT resources it holds and whether each
//! resource is still available. It is the only shared mutable state in the
//! orchestrator: uploads, replicated updates from peers, discovery claims and
//! resource-version monitoring all go through one [`ResourceCatalog`].
//!
//! ## Locking
//!
//! Every read and write happens inside one short critical section on a single
//! mutex. Nothing in this module performs I/O, so callers never hold the lock
//! across a network or process-launch call.
//!
//! ## Revisions
//!
//! Each inserted record is stamped with a catalog-wide revision that only
//! grows. A task remembers the revision it observed when it claimed its
//! resource; a record for the same resource with a higher revision is a newer
//! version of that resource.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from catalog mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The (node, resource) pair is already in the catalog.
    #[error("duplicate record: resource '{resource_id}' already exists on node '{node_id}'")]
    DuplicateRecord {
        node_id: String,
        resource_id: String,
    },

    /// A resource or node identifier was empty.
    #[error("invalid record: {0} cannot be empty")]
    EmptyIdentifier(&'static str),
}

/// Availability of a catalog entry.
///
/// The only transition is `Available -> Used`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Available,
    Used,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Available => write!(f, "available"),
            ResourceStatus::Used => write!(f, "used"),
        }
    }
}

/// One catalog entry. Identity is `(node_id, resource_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub node_id: String,
    pub status: ResourceStatus,
    /// Catalog revision at which this record was inserted.
    pub revision: u64,
}

/// Result of applying an update received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record was new and has been inserted as available.
    Inserted(ResourceRecord),
    /// The record was already known; nothing changed.
    AlreadyPresent(ResourceRecord),
}

impl ApplyOutcome {
    pub fn record(&self) -> &ResourceRecord {
        match self {
            ApplyOutcome::Inserted(record) | ApplyOutcome::AlreadyPresent(record) => record,
        }
    }
}

/// A record claimed by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Snapshot of the record after it was marked used.
    pub record: ResourceRecord,
    /// Catalog revision at the moment of the claim.
    pub observed_revision: u64,
}

#[derive(Debug, Default)]
struct CatalogState {
    nodes: BTreeMap<String, Vec<ResourceRecord>>,
    revision: u64,
}

impl CatalogState {
    fn find(&self, node_id: &str, resource_id: &str) -> Option<&ResourceRecord> {
        self.nodes
            .get(node_id)
            .and_then(|records| records.iter().find(|r| r.resource_id == resource_id))
    }

    /// Insert a new available record, or return the existing one.
    fn insert(&mut self, resource_id: &str, node_id: &str) -> Result<ResourceRecord, ResourceRecord> {
        if let Some(existing) = self.find(node_id, resource_id) {
            return Err(existing.clone());
        }

        self.revision += 1;
        let record = ResourceRecord {
            resource_id: resource_id.to_string(),
            node_id: node_id.to_string(),
            status: ResourceStatus::Available,
            revision: self.revision,
        };
        self.nodes
            .entry(node_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }
}

/// The process-wide resource catalog.
#[derive(Debug, Default)]
pub struct ResourceCatalog {
    state: Mutex<CatalogState>,
}

impl ResourceCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource uploaded at `node_id`.
    ///
    /// Returns the new record for broadcasting. The pair must not already be
    /// present.
    pub fn upload(&self, resource_id: &str, node_id: &str) -> Result<ResourceRecord, CatalogError> {
        validate(resource_id, node_id)?;

        let result = self.state.lock().insert(resource_id, node_id);
        match result {
            Ok(record) => {
                debug!(
                    resource_id = %record.resource_id,
                    node_id = %record.node_id,
                    revision = record.revision,
                    "Catalog record uploaded"
                );
                Ok(record)
            }
            Err(existing) => Err(CatalogError::DuplicateRecord {
                node_id: existing.node_id,
                resource_id: existing.resource_id,
            }),
        }
    }

    /// Apply an update broadcast by the node where the resource was uploaded.
    ///
    /// Re-delivery of a known pair is not an error and changes nothing,
    /// including the record's status.
    pub fn apply_replicated_update(
        &self,
        resource_id: &str,
        node_id: &str,
    ) -> Result<ApplyOutcome, CatalogError> {
        validate(resource_id, node_id)?;

        let result = self.state.lock().insert(resource_id, node_id);
        let outcome = match result {
            Ok(record) => ApplyOutcome::Inserted(record),
            Err(existing) => ApplyOutcome::AlreadyPresent(existing),
        };
        debug!(
            resource_id = %resource_id,
            node_id = %node_id,
            inserted = matches!(outcome, ApplyOutcome::Inserted(_)),
            "Replicated update applied"
        );
        Ok(outcome)
    }

    /// Find the first available record for `resource_id` and mark it used.
    ///
    /// Search and claim run under one lock acquisition, so two concurrent
    /// callers can never claim the same record.
    pub fn find_and_claim(&self, resource_id: &str) -> Option<Claim> {
        let mut state = self.state.lock();
        let observed_revision = state.revision;

        let record = state
            .nodes
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| r.resource_id == resource_id && r.status == ResourceStatus::Available)?;

        record.status = ResourceStatus::Used;
        Some(Claim {
            record: record.clone(),
            observed_revision,
        })
    }

    /// Return a record for `resource_id` inserted after `after_revision`,
    /// regardless of its status.
    pub fn newer_version(&self, resource_id: &str, after_revision: u64) -> Option<ResourceRecord> {
        let state = self.state.lock();
        state
            .nodes
            .values()
            .flatten()
            .filter(|r| r.resource_id == resource_id && r.revision > after_revision)
            .min_by_key(|r| r.revision)
            .cloned()
    }

    /// Look up a single record.
    pub fn get(&self, node_id: &str, resource_id: &str) -> Option<ResourceRecord> {
        self.state.lock().find(node_id, resource_id).cloned()
    }

    /// Copy of every record, ordered by node then upload order.
    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        self.state.lock().nodes.values().flatten().cloned().collect()
    }

    /// Number of available records for `resource_id` across all nodes.
    pub fn available_count(&self, resource_id: &str) -> usize {
        self.state
            .lock()
            .nodes
            .values()
            .flatten()
            .filter(|r| r.resource_id == resource_id && r.status == ResourceStatus::Available)
            .count()
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.state.lock().nodes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current catalog revision.
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }
}

fn validate(resource_id: &str, node_id: &str) -> Result<(), CatalogError> {
    if resource_id.is_empty() {
        return Err(CatalogError::EmptyIdentifier("resource_id"));
    }
    if node_id.is_empty() {
        return Err(CatalogError::EmptyIdentifier("node_id"));
    }
    Ok(())
}
