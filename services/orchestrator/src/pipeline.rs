//! Request pipeline.
//!
//! Four stage workers connected by bounded queues:
//!
//! ```text
//! uploads  -> [upload]   -> catalog + broadcast
//! requests -> [resolve]  -> [discover] -> [launch] -> tracking
//! ```
//!
//! Each worker takes one item at a time from its queue and hands it to a
//! spawned unit of work, so items are processed in parallel while every item
//! still passes through the stages in order. A per-stage semaphore caps the
//! units in flight; once the cap is reached the worker stops reading and the
//! queue applies backpressure to its producer.
//!
//! Uploads are applied to the catalog by the worker itself, in arrival order;
//! only the broadcast runs in the spawned unit.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use edgeplace_events::{EventPayload, RequestUnresolvedPayload, ResourceUploadedPayload};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::catalog::ResourceCatalog;
use crate::discovery::{DiscoveryEngine, DiscoveryResult};
use crate::events::EventBus;
use crate::feeds::ResourceUpload;
use crate::lifecycle::{LaunchOutcome, TaskLifecycleManager};
use crate::lookup::{LookupError, LookupTables, ResolvedRequest};
use crate::replication::Broadcaster;
use crate::shutdown;

/// A client request as it enters the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub name: String,
    /// Pipeline entry time; launch latency is measured from here.
    pub received_at: Instant,
}

impl IncomingRequest {
    /// A request entering the pipeline now.
    pub fn now(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received_at: Instant::now(),
        }
    }
}

/// Everything the stages operate on.
#[derive(Clone)]
pub struct PipelineComponents {
    pub catalog: Arc<ResourceCatalog>,
    pub lookup: Arc<LookupTables>,
    pub discovery: DiscoveryEngine,
    pub lifecycle: TaskLifecycleManager,
    pub broadcaster: Broadcaster,
    pub events: EventBus,
}

/// Queue sizing and fan-out limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Capacity of every stage queue.
    pub queue_capacity: usize,
    /// Units in flight per stage.
    pub max_in_flight: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            max_in_flight: 64,
        }
    }
}

/// Running pipeline.
pub struct PipelineHandle {
    upload_tx: mpsc::Sender<ResourceUpload>,
    request_tx: mpsc::Sender<IncomingRequest>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineHandle {
    /// Sender for the upload queue.
    pub fn upload_sender(&self) -> mpsc::Sender<ResourceUpload> {
        self.upload_tx.clone()
    }

    /// Sender for the request queue.
    pub fn request_sender(&self) -> mpsc::Sender<IncomingRequest> {
        self.request_tx.clone()
    }

    /// Wait for every stage to finish.
    ///
    /// Stages finish once all senders are dropped and their queues drain, or
    /// when shutdown is signalled. Units already in flight are awaited.
    pub async fn join(self) {
        let PipelineHandle {
            upload_tx,
            request_tx,
            workers,
        } = self;
        drop(upload_tx);
        drop(request_tx);

        for (stage, worker) in workers {
            if let Err(e) = worker.await {
                warn!(stage, error = %e, "Pipeline stage panicked");
            }
        }
        info!("Pipeline stopped");
    }
}

/// Pipeline entry point.
pub struct Pipeline;

impl Pipeline {
    /// Spawn the stage workers.
    pub fn start(
        components: PipelineComponents,
        config: PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> PipelineHandle {
        let capacity = config.queue_capacity.max(1);
        let (upload_tx, upload_rx) = mpsc::channel::<ResourceUpload>(capacity);
        let (request_tx, request_rx) = mpsc::channel::<IncomingRequest>(capacity);
        let (resolved_tx, resolved_rx) = mpsc::channel::<ResolvedRequest>(capacity);
        let (placed_tx, placed_rx) = mpsc::channel::<DiscoveryResult>(capacity);

        let limit = || Arc::new(Semaphore::new(config.max_in_flight.max(1)));

        let upload = tokio::spawn(run_stage(
            "upload",
            upload_rx,
            limit(),
            shutdown.clone(),
            upload_handler(&components),
        ));
        let resolve = tokio::spawn(run_stage(
            "resolve",
            request_rx,
            limit(),
            shutdown.clone(),
            resolve_handler(&components, resolved_tx),
        ));
        let discover = tokio::spawn(run_stage(
            "discover",
            resolved_rx,
            limit(),
            shutdown.clone(),
            discover_handler(&components, placed_tx),
        ));
        let launch = tokio::spawn(run_stage(
            "launch",
            placed_rx,
            limit(),
            shutdown,
            launch_handler(&components),
        ));

        info!(
            queue_capacity = capacity,
            max_in_flight = config.max_in_flight,
            "Pipeline started"
        );

        PipelineHandle {
            upload_tx,
            request_tx,
            workers: vec![
                ("upload", upload),
                ("resolve", resolve),
                ("discover", discover),
                ("launch", launch),
            ],
        }
    }
}

/// Apply the upload to the catalog, then broadcast it in the spawned unit.
fn upload_handler(
    components: &PipelineComponents,
) -> impl FnMut(ResourceUpload) -> BoxFuture<'static, ()> {
    let catalog = Arc::clone(&components.catalog);
    let broadcaster = components.broadcaster.clone();
    let events = components.events.clone();

    move |upload: ResourceUpload| -> BoxFuture<'static, ()> {
        let uploaded_at = Instant::now();
        let record = match catalog.upload(&upload.resource_id, &upload.node_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    resource_id = %upload.resource_id,
                    node_id = %upload.node_id,
                    error = %e,
                    "Upload rejected"
                );
                return async {}.boxed();
            }
        };

        events.publish(EventPayload::ResourceUploaded(ResourceUploadedPayload {
            resource_id: record.resource_id.clone(),
            node_id: record.node_id.clone(),
            revision: record.revision,
        }));

        let broadcaster = broadcaster.clone();
        async move {
            broadcaster.broadcast(&record, uploaded_at).await;
        }
        .boxed()
    }
}

/// Resolve the request name and forward it to discovery.
fn resolve_handler(
    components: &PipelineComponents,
    resolved_tx: mpsc::Sender<ResolvedRequest>,
) -> impl FnMut(IncomingRequest) -> BoxFuture<'static, ()> {
    let lookup = Arc::clone(&components.lookup);
    let events = components.events.clone();

    move |request: IncomingRequest| -> BoxFuture<'static, ()> {
        let resolved = match lookup.resolve_at(&request.name, request.received_at) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(request = %request.name, error = %e, "Request unresolved");
                let application = match &e {
                    LookupError::UnknownApplication { application, .. } => {
                        Some(application.clone())
                    }
                    LookupError::UnknownRequest(_) => None,
                };
                events.publish(EventPayload::RequestUnresolved(RequestUnresolvedPayload {
                    request: e.request().to_string(),
                    reason: e.reason(),
                    application,
                }));
                return async {}.boxed();
            }
        };

        debug!(
            request = %resolved.request,
            application = %resolved.application,
            resource_id = %resolved.resource_id,
            "Request resolved"
        );
        let resolved_tx = resolved_tx.clone();
        async move {
            if resolved_tx.send(resolved).await.is_err() {
                debug!("Discover stage closed");
            }
        }
        .boxed()
    }
}

/// Claim a resource and forward placed requests to launch.
fn discover_handler(
    components: &PipelineComponents,
    placed_tx: mpsc::Sender<DiscoveryResult>,
) -> impl FnMut(ResolvedRequest) -> BoxFuture<'static, ()> {
    let discovery = components.discovery.clone();

    move |resolved: ResolvedRequest| -> BoxFuture<'static, ()> {
        let discovery = discovery.clone();
        let placed_tx = placed_tx.clone();
        async move {
            let result = discovery.discover(&resolved);
            if result.is_miss() {
                info!(
                    request = %result.request,
                    resource_id = %result.resource_id,
                    "No available resource for request"
                );
                return;
            }
            if placed_tx.send(result).await.is_err() {
                debug!("Launch stage closed");
            }
        }
        .boxed()
    }
}

/// Launch the workload; tracking continues after the unit finishes.
fn launch_handler(
    components: &PipelineComponents,
) -> impl FnMut(DiscoveryResult) -> BoxFuture<'static, ()> {
    let lifecycle = components.lifecycle.clone();

    move |placement: DiscoveryResult| -> BoxFuture<'static, ()> {
        let lifecycle = lifecycle.clone();
        async move {
            if let LaunchOutcome::Launched { task, .. } = lifecycle.launch(placement).await {
                debug!(task_id = %task.task_id, service = %task.service_name, "Tracking started");
            }
        }
        .boxed()
    }
}

/// Run one stage until its queue closes or shutdown is signalled.
async fn run_stage<T, F, Fut>(
    stage: &'static str,
    mut rx: mpsc::Receiver<T>,
    limit: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
    mut handler: F,
) where
    T: Send + 'static,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown::signalled(&mut shutdown) => {
                debug!(stage, "Stage received shutdown");
                break;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(stage, error = %e, "Stage unit failed");
                }
            }
            item = rx.recv() => {
                let Some(item) = item else {
                    debug!(stage, "Stage queue closed");
                    break;
                };
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let unit = handler(item);
                in_flight.spawn(async move {
                    unit.await;
                    drop(permit);
                });
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(stage, error = %e, "Stage unit failed");
        }
    }
    debug!(stage, "Stage stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use edgeplace_events::{event_types, Event};
    use tokio::sync::broadcast;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::catalog::ResourceStatus;
    use crate::runtime::MockRuntime;

    struct Harness {
        components: PipelineComponents,
        runtime: Arc<MockRuntime>,
        shutdown: watch::Sender<bool>,
    }

    fn harness(runtime: MockRuntime) -> Harness {
        let catalog = Arc::new(ResourceCatalog::new());
        let events = EventBus::new("n1", 1024);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runtime = Arc::new(runtime);

        let mut lookup = LookupTables::empty();
        lookup.insert("req1", "a1", "r1");
        lookup.insert("req2", "a2", "r1");

        let components = PipelineComponents {
            catalog: Arc::clone(&catalog),
            lookup: Arc::new(lookup),
            discovery: DiscoveryEngine::new(Arc::clone(&catalog), events.clone()),
            lifecycle: TaskLifecycleManager::new(
                runtime.clone(),
                Arc::clone(&catalog),
                events.clone(),
                BackoffPolicy::without_jitter(Duration::from_millis(1), Duration::from_millis(5)),
                shutdown_rx,
            ),
            broadcaster: Broadcaster::new(Vec::new(), events.clone()),
            events,
        };

        Harness {
            components,
            runtime,
            shutdown,
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_stage_future_is_send_and_stops_on_shutdown() {
        let (_tx, rx) = mpsc::channel::<u32>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stage = run_stage("test", rx, Arc::new(Semaphore::new(1)), shutdown_rx, |_: u32| {
            async {}.boxed()
        });
        assert_send(&stage);

        let worker = tokio::spawn(stage);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_for_event(rx: &mut broadcast::Receiver<Event>, event_type: &str) -> Event {
        wait_for_events(rx, &[event_type]).await.remove(0)
    }

    /// Collect the first event of each wanted type, in the order given.
    async fn wait_for_events(
        rx: &mut broadcast::Receiver<Event>,
        wanted: &[&str],
    ) -> Vec<Event> {
        let mut found: Vec<Option<Event>> = vec![None; wanted.len()];
        tokio::time::timeout(Duration::from_secs(5), async {
            while found.iter().any(Option::is_none) {
                let event = rx.recv().await.unwrap();
                if let Some(i) = wanted.iter().position(|t| event.event_type == *t) {
                    if found[i].is_none() {
                        found[i] = Some(event);
                    }
                }
            }
        })
        .await
        .unwrap();
        found.into_iter().flatten().collect()
    }

    #[tokio::test]
    async fn test_request_is_placed_at_resource_node() {
        let h = harness(MockRuntime::completing_after(2));
        let mut rx = h.components.events.subscribe();
        let pipeline = Pipeline::start(
            h.components.clone(),
            PipelineConfig::default(),
            h.shutdown.subscribe(),
        );

        pipeline
            .upload_sender()
            .send(ResourceUpload::new("r1", "n1"))
            .await
            .unwrap();
        wait_for_event(&mut rx, event_types::RESOURCE_UPLOADED).await;

        pipeline
            .request_sender()
            .send(IncomingRequest::now("req1"))
            .await
            .unwrap();
        wait_for_event(&mut rx, event_types::TASK_LAUNCHED).await;
        wait_for_event(&mut rx, event_types::TASK_TERMINATED).await;

        let created = h.runtime.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "req1");
        assert_eq!(created[0].image, "a1");
        assert_eq!(created[0].placement_constraint, "n1");
        assert_eq!(
            h.components.catalog.get("n1", "r1").unwrap().status,
            ResourceStatus::Used
        );

        pipeline.join().await;
    }

    #[tokio::test]
    async fn test_second_request_for_claimed_resource_misses() {
        let h = harness(MockRuntime::never_completing());
        let mut rx = h.components.events.subscribe();
        let pipeline = Pipeline::start(
            h.components.clone(),
            PipelineConfig::default(),
            h.shutdown.subscribe(),
        );

        pipeline
            .upload_sender()
            .send(ResourceUpload::new("r1", "n1"))
            .await
            .unwrap();
        wait_for_event(&mut rx, event_types::RESOURCE_UPLOADED).await;

        let requests = pipeline.request_sender();
        requests.send(IncomingRequest::now("req1")).await.unwrap();
        requests.send(IncomingRequest::now("req2")).await.unwrap();

        let events = wait_for_events(
            &mut rx,
            &[event_types::DISCOVERY_MISSED, event_types::TASK_LAUNCHED],
        )
        .await;
        assert_eq!(events[0].aggregate_kind.to_string(), "request");
        assert_eq!(h.runtime.created().len(), 1);

        h.shutdown.send(true).unwrap();
        drop(requests);
        tokio::time::timeout(Duration::from_secs(5), pipeline.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_upload_and_unknown_request() {
        let h = harness(MockRuntime::new());
        let mut rx = h.components.events.subscribe();
        let pipeline = Pipeline::start(
            h.components.clone(),
            PipelineConfig::default(),
            h.shutdown.subscribe(),
        );

        let uploads = pipeline.upload_sender();
        uploads.send(ResourceUpload::new("r1", "n1")).await.unwrap();
        uploads.send(ResourceUpload::new("r1", "n1")).await.unwrap();
        pipeline
            .request_sender()
            .send(IncomingRequest::now("nope"))
            .await
            .unwrap();

        wait_for_event(&mut rx, event_types::REQUEST_UNRESOLVED).await;
        drop(uploads);
        pipeline.join().await;

        assert_eq!(h.components.catalog.len(), 1);
        assert!(h.runtime.created().is_empty());
    }
}
