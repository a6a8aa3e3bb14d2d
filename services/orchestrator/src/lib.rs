//! edgeplace orchestrator
//!
//! Places client workloads on the edge node that holds the IoT resource they
//! consume, and keeps every node's view of resource availability in step.
//!
//! ## Architecture
//!
//! - **Catalog**: per-process table of resources by node, with atomic claims
//! - **Replication**: gRPC broadcast of uploads to peers, one hop only
//! - **Discovery**: claims an available resource for a resolved request
//! - **Lifecycle**: launches the workload and tracks it to termination
//! - **Pipeline**: bounded queues and stage workers tying the above together

pub mod backoff;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod events;
pub mod feeds;
pub mod lifecycle;
pub mod lookup;
pub mod memstats;
pub mod pipeline;
pub mod replication;
pub mod runtime;
pub mod shutdown;

pub use catalog::{CatalogError, ResourceCatalog, ResourceRecord, ResourceStatus};
pub use config::Config;
pub use discovery::{DiscoveryEngine, DiscoveryResult};
pub use events::EventBus;
pub use lifecycle::{LaunchOutcome, MonitorOutcome, TaskLifecycleManager, VersionWatch};
pub use pipeline::{Pipeline, PipelineComponents, PipelineConfig, PipelineHandle};
pub use replication::{BroadcastReport, Broadcaster, ReplicationError};
pub use runtime::{ContainerRuntime, DockerSwarmRuntime, MockRuntime};
