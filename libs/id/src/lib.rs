//! # edgeplace-id
//!
//! Typed identifiers for the edgeplace orchestrator.
//!
//! Node and resource identifiers are operator-chosen strings and stay plain
//! `String`s. Everything the orchestrator mints itself gets a typed ID:
//!
//! - `task_01HV4Z4NYPLTRS0JTUA8XDME5F` for a launched workload
//! - `bcast_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for one broadcast of a catalog upload
//! - a monotonic integer [`EventId`] for every published event
//!
//! Prefixed IDs are `{prefix}_{ulid}`, parse strictly, and sort by creation
//! time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::PrefixedId;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
