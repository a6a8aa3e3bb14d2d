//! Event type definitions for all orchestrator events.
//!
//! Each event type has a payload struct with the event-specific data, and
//! [`EventPayload`] ties each payload to its event type name.

use edgeplace_id::{BroadcastId, TaskId};
use serde::{Deserialize, Serialize};

use crate::envelope::AggregateKind;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Resource catalog
    pub const RESOURCE_UPLOADED: &str = "resource.uploaded";
    pub const RESOURCE_REPLICATED: &str = "resource.replicated";
    pub const RESOURCE_REPLICATION_FAILED: &str = "resource.replication_failed";
    pub const RESOURCE_PROPAGATED: &str = "resource.propagated";
    pub const RESOURCE_CLAIMED: &str = "resource.claimed";

    // Requests
    pub const REQUEST_UNRESOLVED: &str = "request.unresolved";
    pub const DISCOVERY_MISSED: &str = "discovery.missed";

    // Tasks
    pub const TASK_LAUNCHED: &str = "task.launched";
    pub const TASK_LAUNCH_FAILED: &str = "task.launch_failed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_RESOURCE_VERSION_ARRIVED: &str = "task.resource_version_arrived";
    pub const TASK_MONITOR_CANCELLED: &str = "task.monitor_cancelled";
    pub const TASK_TERMINATED: &str = "task.terminated";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Lifecycle status of a launched task.
///
/// Transitions only move forward:
/// `Created -> Running -> Completed -> Terminated`, or
/// `Created -> LaunchFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Terminated,
    LaunchFailed,
}

impl TaskStatus {
    /// Returns true if `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Created, TaskStatus::Running)
                | (TaskStatus::Created, TaskStatus::LaunchFailed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Completed, TaskStatus::Terminated)
        )
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Terminated | TaskStatus::LaunchFailed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Terminated => "terminated",
            TaskStatus::LaunchFailed => "launch_failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a request could not be resolved to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    UnknownRequest,
    UnknownApplication,
}

// -----------------------------------------------------------------------------
// Resource Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUploadedPayload {
    pub resource_id: String,
    pub node_id: String,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReplicatedPayload {
    pub broadcast_id: BroadcastId,
    pub resource_id: String,
    pub node_id: String,
    pub peer: String,
    pub attempts: u32,
    pub ack: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReplicationFailedPayload {
    pub broadcast_id: BroadcastId,
    pub resource_id: String,
    pub node_id: String,
    pub peer: String,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePropagatedPayload {
    pub broadcast_id: BroadcastId,
    pub resource_id: String,
    pub node_id: String,
    pub first_peer: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceClaimedPayload {
    pub request: String,
    pub resource_id: String,
    pub node_id: String,
}

// -----------------------------------------------------------------------------
// Request Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestUnresolvedPayload {
    pub request: String,
    pub reason: UnresolvedReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMissedPayload {
    pub request: String,
    pub application: String,
    pub resource_id: String,
}

// -----------------------------------------------------------------------------
// Task Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLaunchedPayload {
    pub task_id: TaskId,
    pub service_name: String,
    pub image: String,
    pub target_node: String,
    pub resource_id: String,
    pub pipeline_latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLaunchFailedPayload {
    pub task_id: TaskId,
    pub service_name: String,
    pub image: String,
    pub target_node: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub task_id: TaskId,
    pub service_name: String,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersionArrivedPayload {
    pub task_id: TaskId,
    pub service_name: String,
    pub resource_id: String,
    /// Node holding the newer version.
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMonitorCancelledPayload {
    pub task_id: TaskId,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTerminatedPayload {
    pub task_id: TaskId,
    pub service_name: String,
}

// =============================================================================
// Payload Enum
// =============================================================================

/// Every payload the orchestrator publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    ResourceUploaded(ResourceUploadedPayload),
    ResourceReplicated(ResourceReplicatedPayload),
    ResourceReplicationFailed(ResourceReplicationFailedPayload),
    ResourcePropagated(ResourcePropagatedPayload),
    ResourceClaimed(ResourceClaimedPayload),
    RequestUnresolved(RequestUnresolvedPayload),
    DiscoveryMissed(DiscoveryMissedPayload),
    TaskLaunched(TaskLaunchedPayload),
    TaskLaunchFailed(TaskLaunchFailedPayload),
    TaskCompleted(TaskCompletedPayload),
    ResourceVersionArrived(ResourceVersionArrivedPayload),
    TaskMonitorCancelled(TaskMonitorCancelledPayload),
    TaskTerminated(TaskTerminatedPayload),
}

impl EventPayload {
    /// The event type name for this payload.
    pub fn event_type(&self) -> &'static str {
        use event_types::*;
        match self {
            EventPayload::ResourceUploaded(_) => RESOURCE_UPLOADED,
            EventPayload::ResourceReplicated(_) => RESOURCE_REPLICATED,
            EventPayload::ResourceReplicationFailed(_) => RESOURCE_REPLICATION_FAILED,
            EventPayload::ResourcePropagated(_) => RESOURCE_PROPAGATED,
            EventPayload::ResourceClaimed(_) => RESOURCE_CLAIMED,
            EventPayload::RequestUnresolved(_) => REQUEST_UNRESOLVED,
            EventPayload::DiscoveryMissed(_) => DISCOVERY_MISSED,
            EventPayload::TaskLaunched(_) => TASK_LAUNCHED,
            EventPayload::TaskLaunchFailed(_) => TASK_LAUNCH_FAILED,
            EventPayload::TaskCompleted(_) => TASK_COMPLETED,
            EventPayload::ResourceVersionArrived(_) => TASK_RESOURCE_VERSION_ARRIVED,
            EventPayload::TaskMonitorCancelled(_) => TASK_MONITOR_CANCELLED,
            EventPayload::TaskTerminated(_) => TASK_TERMINATED,
        }
    }

    /// The aggregate this payload is about.
    pub fn aggregate(&self) -> (AggregateKind, String) {
        fn resource(node: &str, resource: &str) -> (AggregateKind, String) {
            (AggregateKind::Resource, format!("{}/{}", node, resource))
        }
        match self {
            EventPayload::ResourceUploaded(p) => resource(&p.node_id, &p.resource_id),
            EventPayload::ResourceReplicated(p) => resource(&p.node_id, &p.resource_id),
            EventPayload::ResourceReplicationFailed(p) => resource(&p.node_id, &p.resource_id),
            EventPayload::ResourcePropagated(p) => resource(&p.node_id, &p.resource_id),
            EventPayload::ResourceClaimed(p) => resource(&p.node_id, &p.resource_id),
            EventPayload::RequestUnresolved(p) => (AggregateKind::Request, p.request.clone()),
            EventPayload::DiscoveryMissed(p) => (AggregateKind::Request, p.request.clone()),
            EventPayload::TaskLaunched(p) => (AggregateKind::Task, p.task_id.to_string()),
            EventPayload::TaskLaunchFailed(p) => (AggregateKind::Task, p.task_id.to_string()),
            EventPayload::TaskCompleted(p) => (AggregateKind::Task, p.task_id.to_string()),
            EventPayload::ResourceVersionArrived(p) => {
                (AggregateKind::Task, p.task_id.to_string())
            }
            EventPayload::TaskMonitorCancelled(p) => (AggregateKind::Task, p.task_id.to_string()),
            EventPayload::TaskTerminated(p) => (AggregateKind::Task, p.task_id.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
