//! edgeplace orchestrator node
//!
//! Runs the replication server, the request pipeline and the input feeds for
//! one edge node until interrupted.

use std::sync::Arc;

use anyhow::Result;
use edgeplace_orchestrator::events::DEFAULT_EVENT_CAPACITY;
use edgeplace_orchestrator::feeds;
use edgeplace_orchestrator::lookup::LookupTables;
use edgeplace_orchestrator::{
    memstats, replication, Broadcaster, Config, DiscoveryEngine, DockerSwarmRuntime, EventBus,
    Pipeline, PipelineComponents, PipelineConfig, ResourceCatalog, TaskLifecycleManager,
};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        peers = ?config.peers,
        "Starting edgeplace orchestrator"
    );

    let lookup = match &config.lookup_file {
        Some(path) => LookupTables::from_file(path)?,
        None => LookupTables::default(),
    };
    let uploads = feeds::load_resources(&config.resources_file)?;
    let requests = feeds::load_requests(&config.requests_file)?;
    info!(
        uploads = uploads.len(),
        requests = requests.len(),
        "Feeds loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let events = EventBus::new(config.node_id.clone(), DEFAULT_EVENT_CAPACITY);
    let catalog = Arc::new(ResourceCatalog::new());

    let mut server_handle = tokio::spawn(replication::serve(
        config.listen_addr,
        Arc::clone(&catalog),
        shutdown_rx.clone(),
    ));

    let runtime = Arc::new(DockerSwarmRuntime::new(
        config.docker_bin.clone(),
        config.constraint_key.clone(),
    ));
    let components = PipelineComponents {
        catalog: Arc::clone(&catalog),
        lookup: Arc::new(lookup),
        discovery: DiscoveryEngine::new(Arc::clone(&catalog), events.clone()),
        lifecycle: TaskLifecycleManager::new(
            runtime,
            Arc::clone(&catalog),
            events.clone(),
            config.poll_backoff(),
            shutdown_rx.clone(),
        ),
        broadcaster: Broadcaster::new(config.peers.clone(), events.clone())
            .with_timeout(config.rpc_timeout)
            .with_attempts(config.replication_attempts),
        events,
    };
    let pipeline = Pipeline::start(
        components,
        PipelineConfig {
            queue_capacity: config.queue_capacity,
            max_in_flight: config.max_in_flight,
        },
        shutdown_rx.clone(),
    );

    tokio::spawn(feeds::produce_uploads(
        uploads,
        pipeline.upload_sender(),
        config.peer_warmup,
        shutdown_rx.clone(),
    ));
    tokio::spawn(feeds::produce_requests(
        requests,
        pipeline.request_sender(),
        config.peer_warmup + config.startup_delay,
        config.request_interval,
        shutdown_rx.clone(),
    ));
    let memstats_handle = tokio::spawn(memstats::run(config.memstats_interval, shutdown_rx));

    // Wait for shutdown signal
    let mut server_done = false;
    let mut server_error = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            server_done = true;
            server_error = server_exit(result);
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !server_done {
        server_error = server_exit(server_handle.await);
    }
    pipeline.join().await;
    let _ = memstats_handle.await;

    info!(records = catalog.len(), "Orchestrator shutdown complete");
    match server_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Log how the replication server ended; returns its error, if any.
fn server_exit(result: Result<Result<()>, JoinError>) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) => {
            info!("Replication server stopped");
            None
        }
        Ok(Err(e)) => {
            error!(error = %e, "Replication server error");
            Some(e)
        }
        Err(e) => {
            error!(error = %e, "Replication server panicked");
            None
        }
    }
}
