//! Task lifecycle manager.
//!
//! Launches a workload for every placed request and follows it until it is
//! done:
//! - Submits the service to the container runtime, pinned to the target node
//! - Polls the runtime with backoff until the service reports completion
//! - Watches the catalog for a newer version of the task's resource while the
//!   task runs
//!
//! Each launched task gets one tracking unit. The tracker owns the
//! resource-version monitor and cancels it through a oneshot once the
//! service completes, so exactly one of "new version arrived" or "monitor
//! cancelled" is reported per task.
//!
//! A failed launch moves the task to `LaunchFailed` and starts no tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use edgeplace_events::{
    EventPayload, ResourceVersionArrivedPayload, TaskCompletedPayload, TaskLaunchFailedPayload,
    TaskLaunchedPayload, TaskMonitorCancelledPayload, TaskStatus, TaskTerminatedPayload,
};
use edgeplace_id::TaskId;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::catalog::{ResourceCatalog, ResourceRecord};
use crate::discovery::DiscoveryResult;
use crate::events::EventBus;
use crate::runtime::{is_completed, ContainerRuntime, ServiceSpec};

/// One task in the task table.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    /// Service name; the request that triggered the launch.
    pub service_name: String,
    pub image: String,
    pub target_node: String,
    /// Resource the task consumes.
    pub resource_in_use: String,
    /// Catalog revision observed when the resource was claimed.
    pub claimed_revision: u64,
    pub status: TaskStatus,
    /// When the launch call returned successfully.
    pub start_time: Option<DateTime<Utc>>,
    /// Pipeline entry to launch submission.
    pub pipeline_latency: Option<Duration>,
    pub error_message: Option<String>,
}

/// Immutable view of a task returned to the caller of [`TaskLifecycleManager::launch`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedTask {
    pub task_id: TaskId,
    pub service_name: String,
    pub image: String,
    pub target_node: String,
    pub resource_in_use: String,
    pub start_time: DateTime<Utc>,
    pub pipeline_latency: Duration,
}

/// How the resource-version monitor ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    /// A newer record for the resource appeared in the catalog.
    NewVersion(ResourceRecord),
    /// The task completed first (or tracking was abandoned).
    Cancelled,
}

/// Final report of one task's tracking unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingReport {
    /// Status queries issued to the runtime.
    pub polls: u32,
    /// False if tracking stopped on shutdown before the service completed.
    pub completed: bool,
    pub monitor: MonitorOutcome,
}

/// Result of a launch attempt.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// Submitted; `tracking` resolves once the task is terminated.
    Launched {
        task: LaunchedTask,
        tracking: JoinHandle<TrackingReport>,
    },
    /// The runtime rejected the service. The task is `LaunchFailed`.
    Failed { task_id: TaskId, reason: String },
    /// Discovery found no node for the request; nothing was launched.
    NoPlacement { request: String },
}

impl LaunchOutcome {
    pub fn is_launched(&self) -> bool {
        matches!(self, LaunchOutcome::Launched { .. })
    }
}

/// Table of every task this process has launched.
#[derive(Debug, Default)]
struct TaskTable {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl TaskTable {
    async fn insert(&self, record: TaskRecord) {
        self.tasks.write().await.insert(record.task_id, record);
    }

    /// Move a task forward, applying `update` on success. Illegal transitions
    /// are logged and leave the record untouched.
    async fn transition(
        &self,
        task_id: TaskId,
        next: TaskStatus,
        update: impl FnOnce(&mut TaskRecord),
    ) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(record) = tasks.get_mut(&task_id) else {
            warn!(%task_id, "Transition for unknown task");
            return false;
        };

        if !record.status.can_transition_to(next) {
            warn!(%task_id, from = %record.status, to = %next, "Rejected task transition");
            return false;
        }

        debug!(%task_id, from = %record.status, to = %next, "Task transition");
        record.status = next;
        update(record);
        true
    }
}

/// Launches tasks and tracks them to termination.
#[derive(Clone)]
pub struct TaskLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<ResourceCatalog>,
    events: EventBus,
    tasks: Arc<TaskTable>,
    backoff: BackoffPolicy,
    shutdown: watch::Receiver<bool>,
}

impl TaskLifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<ResourceCatalog>,
        events: EventBus,
        backoff: BackoffPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runtime,
            catalog,
            events,
            tasks: Arc::new(TaskTable::default()),
            backoff,
            shutdown,
        }
    }

    /// Submit the workload for a placed request and start tracking it.
    pub async fn launch(&self, placement: DiscoveryResult) -> LaunchOutcome {
        let Some(target_node) = placement.target_node.clone() else {
            debug!(request = %placement.request, "No placement, skipping launch");
            return LaunchOutcome::NoPlacement {
                request: placement.request,
            };
        };

        let task_id = TaskId::new();
        self.tasks
            .insert(TaskRecord {
                task_id,
                service_name: placement.request.clone(),
                image: placement.application_to_launch.clone(),
                target_node: target_node.clone(),
                resource_in_use: placement.resource_id.clone(),
                claimed_revision: placement.claimed_revision,
                status: TaskStatus::Created,
                start_time: None,
                pipeline_latency: None,
                error_message: None,
            })
            .await;

        let spec = ServiceSpec {
            name: placement.request.clone(),
            image: placement.application_to_launch.clone(),
            placement_constraint: target_node.clone(),
        };

        let result = self.runtime.create_service(&spec).await;
        let pipeline_latency = placement.received_at.elapsed();

        match result {
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    %task_id,
                    service = %spec.name,
                    target_node = %target_node,
                    error = %reason,
                    "Launch failed"
                );
                self.tasks
                    .transition(task_id, TaskStatus::LaunchFailed, |record| {
                        record.pipeline_latency = Some(pipeline_latency);
                        record.error_message = Some(reason.clone());
                    })
                    .await;
                self.events
                    .publish(EventPayload::TaskLaunchFailed(TaskLaunchFailedPayload {
                        task_id,
                        service_name: spec.name,
                        image: spec.image,
                        target_node,
                        reason: reason.clone(),
                    }));
                LaunchOutcome::Failed { task_id, reason }
            }
            Ok(output) => {
                let start_time = Utc::now();
                info!(
                    %task_id,
                    service = %spec.name,
                    target_node = %target_node,
                    output = %output,
                    pipeline_latency_ms = pipeline_latency.as_millis() as u64,
                    "Task launched"
                );
                self.tasks
                    .transition(task_id, TaskStatus::Running, |record| {
                        record.start_time = Some(start_time);
                        record.pipeline_latency = Some(pipeline_latency);
                    })
                    .await;
                self.events
                    .publish(EventPayload::TaskLaunched(TaskLaunchedPayload {
                        task_id,
                        service_name: spec.name.clone(),
                        image: spec.image.clone(),
                        target_node: target_node.clone(),
                        resource_id: placement.resource_id.clone(),
                        pipeline_latency_ms: pipeline_latency.as_millis() as u64,
                    }));

                let tracking = tokio::spawn(self.clone().track(
                    task_id,
                    spec.name.clone(),
                    placement.resource_id.clone(),
                    placement.claimed_revision,
                ));

                LaunchOutcome::Launched {
                    task: LaunchedTask {
                        task_id,
                        service_name: spec.name,
                        image: spec.image,
                        target_node,
                        resource_in_use: placement.resource_id,
                        start_time,
                        pipeline_latency,
                    },
                    tracking,
                }
            }
        }
    }

    /// Current status of a task.
    pub async fn task_state(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.tasks
            .tasks
            .read()
            .await
            .get(&task_id)
            .map(|record| record.status)
    }

    /// Snapshot of one task.
    pub async fn task(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.tasks.tasks.read().await.get(&task_id).cloned()
    }

    /// Snapshot of every task.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.tasks.read().await.values().cloned().collect()
    }

    /// Number of tasks still being tracked.
    pub async fn active_count(&self) -> usize {
        self.tasks
            .tasks
            .read()
            .await
            .values()
            .filter(|record| matches!(record.status, TaskStatus::Running | TaskStatus::Completed))
            .count()
    }

    /// Completion tracker. Owns the paired resource-version monitor and joins
    /// it once the service completes; the monitor reports its own outcome.
    async fn track(
        self,
        task_id: TaskId,
        service_name: String,
        resource_id: String,
        claimed_revision: u64,
    ) -> TrackingReport {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_resource_version(
            Arc::clone(&self.catalog),
            self.events.clone(),
            VersionWatch {
                task_id,
                service_name: service_name.clone(),
                resource_id,
                after_revision: claimed_revision,
            },
            cancel_rx,
            self.backoff.clone(),
        ));

        let (polls, completed) = self.poll_until_complete(task_id, &service_name).await;
        if completed {
            info!(%task_id, service = %service_name, polls, "Task completed");
            self.tasks
                .transition(task_id, TaskStatus::Completed, |_| {})
                .await;
            self.events
                .publish(EventPayload::TaskCompleted(TaskCompletedPayload {
                    task_id,
                    service_name: service_name.clone(),
                    polls,
                }));
        } else {
            info!(%task_id, service = %service_name, polls, "Tracking stopped before completion");
        }

        // Monitor may already have finished.
        let _ = cancel_tx.send(());
        let outcome = match monitor.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%task_id, error = %e, "Resource-version monitor panicked");
                MonitorOutcome::Cancelled
            }
        };

        if completed
            && self
                .tasks
                .transition(task_id, TaskStatus::Terminated, |_| {})
                .await
        {
            self.events
                .publish(EventPayload::TaskTerminated(TaskTerminatedPayload {
                    task_id,
                    service_name,
                }));
        }

        TrackingReport {
            polls,
            completed,
            monitor: outcome,
        }
    }

    /// Query the runtime with backoff until completion or shutdown.
    /// Returns the number of queries and whether completion was observed.
    async fn poll_until_complete(&self, task_id: TaskId, service_name: &str) -> (u32, bool) {
        let mut shutdown = self.shutdown.clone();
        let mut polls: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return (polls, false);
            }

            polls += 1;
            match self.runtime.service_status(service_name).await {
                Ok(status) if is_completed(&status) => return (polls, true),
                Ok(status) => {
                    debug!(%task_id, service = %service_name, status = %status.trim(), "Task not complete");
                }
                Err(e) => {
                    warn!(%task_id, service = %service_name, error = %e, "Status query failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.backoff.delay(polls - 1)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return (polls, false);
                    }
                }
            }
        }
    }
}

/// What a resource-version monitor watches for, and on behalf of which task.
#[derive(Debug, Clone)]
pub struct VersionWatch {
    pub task_id: TaskId,
    pub service_name: String,
    pub resource_id: String,
    /// Only records newer than this catalog revision count.
    pub after_revision: u64,
}

/// Watch the catalog for a record of `target.resource_id` newer than
/// `target.after_revision` until one appears or `cancel` fires.
///
/// The outcome is published the moment it is known: a new version emits
/// `task.resource_version_arrived` while the task may still be running.
/// A dropped sender counts as cancellation. Cancellation is checked before
/// every catalog inspection.
pub async fn monitor_resource_version(
    catalog: Arc<ResourceCatalog>,
    events: EventBus,
    target: VersionWatch,
    cancel: oneshot::Receiver<()>,
    backoff: BackoffPolicy,
) -> MonitorOutcome {
    let outcome = watch_catalog(&catalog, &target, cancel, &backoff).await;

    match &outcome {
        MonitorOutcome::NewVersion(record) => {
            info!(
                task_id = %target.task_id,
                resource_id = %record.resource_id,
                node_id = %record.node_id,
                "New resource version arrived"
            );
            events.publish(EventPayload::ResourceVersionArrived(
                ResourceVersionArrivedPayload {
                    task_id: target.task_id,
                    service_name: target.service_name,
                    resource_id: record.resource_id.clone(),
                    node_id: record.node_id.clone(),
                },
            ));
        }
        MonitorOutcome::Cancelled => {
            debug!(
                task_id = %target.task_id,
                resource_id = %target.resource_id,
                "Resource-version monitor cancelled"
            );
            events.publish(EventPayload::TaskMonitorCancelled(TaskMonitorCancelledPayload {
                task_id: target.task_id,
                resource_id: target.resource_id,
            }));
        }
    }

    outcome
}

async fn watch_catalog(
    catalog: &ResourceCatalog,
    target: &VersionWatch,
    mut cancel: oneshot::Receiver<()>,
    backoff: &BackoffPolicy,
) -> MonitorOutcome {
    let mut attempt: u32 = 0;

    loop {
        match cancel.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {}
            Ok(()) | Err(oneshot::error::TryRecvError::Closed) => return MonitorOutcome::Cancelled,
        }

        if let Some(record) = catalog.newer_version(&target.resource_id, target.after_revision) {
            return MonitorOutcome::NewVersion(record);
        }

        tokio::select! {
            biased;
            _ = &mut cancel => return MonitorOutcome::Cancelled,
            _ = tokio::time::sleep(backoff.delay(attempt)) => {}
        }
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use edgeplace_events::event_types;

    use super::*;
    use crate::runtime::MockRuntime;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::without_jitter(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn placement(catalog: &ResourceCatalog, request: &str, resource: &str) -> DiscoveryResult {
        let claim = catalog.find_and_claim(resource);
        DiscoveryResult {
            request: request.to_string(),
            application_to_launch: "a1".to_string(),
            resource_id: resource.to_string(),
            target_node: claim.as_ref().map(|c| c.record.node_id.clone()),
            claimed_revision: claim.map(|c| c.observed_revision).unwrap_or(0),
            received_at: Instant::now(),
        }
    }

    fn watch_for(resource: &str) -> VersionWatch {
        VersionWatch {
            task_id: TaskId::new(),
            service_name: "req1".to_string(),
            resource_id: resource.to_string(),
            after_revision: 0,
        }
    }

    fn manager(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<ResourceCatalog>,
    ) -> (TaskLifecycleManager, EventBus, watch::Sender<bool>) {
        let events = EventBus::new("n1", 256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = TaskLifecycleManager::new(
            runtime,
            catalog,
            events.clone(),
            fast_backoff(),
            shutdown_rx,
        );
        (manager, events, shutdown_tx)
    }

    #[tokio::test]
    async fn test_launch_tracks_to_termination() {
        let catalog = Arc::new(ResourceCatalog::new());
        catalog.upload("r1", "n1").unwrap();
        let runtime = Arc::new(MockRuntime::completing_after(3));
        let (manager, _events, _shutdown) = manager(runtime.clone(), Arc::clone(&catalog));

        let outcome = manager.launch(placement(&catalog, "req1", "r1")).await;
        let LaunchOutcome::Launched { task, tracking } = outcome else {
            panic!("expected launch");
        };
        assert_eq!(task.target_node, "n1");
        assert_eq!(runtime.created()[0].placement_constraint, "n1");

        let report = tracking.await.unwrap();
        assert!(report.completed);
        assert_eq!(report.polls, 3);
        assert_eq!(report.monitor, MonitorOutcome::Cancelled);
        assert_eq!(manager.task_state(task.task_id).await, Some(TaskStatus::Terminated));
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_terminal_without_tracking() {
        let catalog = Arc::new(ResourceCatalog::new());
        catalog.upload("r1", "n1").unwrap();
        let runtime = Arc::new(MockRuntime::failing());
        let (manager, events, _shutdown) = manager(runtime.clone(), Arc::clone(&catalog));
        let mut rx = events.subscribe();

        let outcome = manager.launch(placement(&catalog, "req1", "r1")).await;
        let LaunchOutcome::Failed { task_id, .. } = outcome else {
            panic!("expected failure");
        };

        let record = manager.task(task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::LaunchFailed);
        assert!(record.error_message.is_some());
        assert_eq!(runtime.poll_count("req1"), 0);
        assert_eq!(rx.try_recv().unwrap().event_type, event_types::TASK_LAUNCH_FAILED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_launch_without_placement() {
        let catalog = Arc::new(ResourceCatalog::new());
        let runtime = Arc::new(MockRuntime::new());
        let (manager, _events, _shutdown) = manager(runtime.clone(), Arc::clone(&catalog));

        let outcome = manager.launch(placement(&catalog, "req1", "r1")).await;
        assert!(matches!(outcome, LaunchOutcome::NoPlacement { .. }));
        assert!(runtime.created().is_empty());
        assert!(manager.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_new_version_is_reported_once() {
        let catalog = Arc::new(ResourceCatalog::new());
        catalog.upload("r1", "n1").unwrap();
        let runtime = Arc::new(MockRuntime::completing_after(200));
        let (manager, events, _shutdown) = manager(runtime, Arc::clone(&catalog));
        let mut rx = events.subscribe();

        let LaunchOutcome::Launched { tracking, .. } =
            manager.launch(placement(&catalog, "req1", "r1")).await
        else {
            panic!("expected launch");
        };
        catalog.upload("r1", "n2").unwrap();

        let report = tracking.await.unwrap();
        match report.monitor {
            MonitorOutcome::NewVersion(record) => assert_eq!(record.node_id, "n2"),
            other => panic!("expected new version, got {other:?}"),
        }

        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(
            types
                .iter()
                .filter(|t| *t == event_types::TASK_RESOURCE_VERSION_ARRIVED)
                .count(),
            1
        );
        assert!(!types.iter().any(|t| t == event_types::TASK_MONITOR_CANCELLED));
        assert_eq!(types.last().map(String::as_str), Some(event_types::TASK_TERMINATED));
    }

    #[tokio::test]
    async fn test_new_version_is_reported_while_task_runs() {
        let catalog = Arc::new(ResourceCatalog::new());
        catalog.upload("r1", "n1").unwrap();
        let runtime = Arc::new(MockRuntime::never_completing());
        let (manager, events, shutdown) = manager(runtime, Arc::clone(&catalog));
        let mut rx = events.subscribe();

        let LaunchOutcome::Launched { task, tracking } =
            manager.launch(placement(&catalog, "req1", "r1")).await
        else {
            panic!("expected launch");
        };
        catalog.upload("r1", "n2").unwrap();

        let arrived = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.event_type == event_types::TASK_RESOURCE_VERSION_ARRIVED {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(arrived.aggregate_id, task.task_id.to_string());
        assert_eq!(manager.task_state(task.task_id).await, Some(TaskStatus::Running));

        shutdown.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), tracking)
            .await
            .unwrap()
            .unwrap();
        assert!(!report.completed);
        assert!(matches!(report.monitor, MonitorOutcome::NewVersion(_)));
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.event_type, event_types::TASK_RESOURCE_VERSION_ARRIVED);
            assert_ne!(event.event_type, event_types::TASK_MONITOR_CANCELLED);
        }
    }

    #[tokio::test]
    async fn test_monitor_cancelled_before_inspecting() {
        let catalog = Arc::new(ResourceCatalog::new());
        catalog.upload("r1", "n1").unwrap();
        catalog.upload("r1", "n2").unwrap();

        let events = EventBus::new("n1", 16);
        let mut events_rx = events.subscribe();

        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        let outcome =
            monitor_resource_version(catalog, events, watch_for("r1"), rx, fast_backoff()).await;
        assert_eq!(outcome, MonitorOutcome::Cancelled);
        assert_eq!(
            events_rx.try_recv().unwrap().event_type,
            event_types::TASK_MONITOR_CANCELLED
        );
    }

    #[tokio::test]
    async fn test_monitor_dropped_sender_cancels() {
        let catalog = Arc::new(ResourceCatalog::new());
        let (tx, rx) = oneshot::channel::<()>();
        let monitor = tokio::spawn(monitor_resource_version(
            catalog,
            EventBus::new("n1", 16),
            watch_for("r1"),
            rx,
            fast_backoff(),
        ));
        drop(tx);
        assert_eq!(monitor.await.unwrap(), MonitorOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_stops_tracking() {
        let catalog = Arc::new(ResourceCatalog::new());
        catalog.upload("r1", "n1").unwrap();
        let runtime = Arc::new(MockRuntime::never_completing());
        let (manager, _events, shutdown) = manager(runtime, Arc::clone(&catalog));

        let LaunchOutcome::Launched { task, tracking } =
            manager.launch(placement(&catalog, "req1", "r1")).await
        else {
            panic!("expected launch");
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), tracking)
            .await
            .unwrap()
            .unwrap();
        assert!(!report.completed);
        assert_eq!(report.monitor, MonitorOutcome::Cancelled);
        assert_eq!(manager.task_state(task.task_id).await, Some(TaskStatus::Running));
    }
}
