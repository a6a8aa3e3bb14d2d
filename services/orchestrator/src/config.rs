//! Configuration for the orchestrator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::backoff::BackoffPolicy;

const ENV_PREFIX: &str = "EDGEPLACE_";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of this node; stamped on events.
    pub node_id: String,

    /// Address the replication server binds.
    pub listen_addr: SocketAddr,

    /// Peer replication endpoints.
    pub peers: Vec<String>,

    /// Dial and acknowledgment timeout per replication call.
    pub rpc_timeout: Duration,

    /// Attempts per peer per broadcast.
    pub replication_attempts: u32,

    /// Capacity of each pipeline queue.
    pub queue_capacity: usize,

    /// Maximum items processed concurrently per pipeline stage.
    pub max_in_flight: usize,

    /// Delay before the first re-poll of a task or the catalog.
    pub poll_base: Duration,

    /// Upper bound on the delay between polls.
    pub poll_max: Duration,

    /// Resource-upload feed.
    pub resources_file: PathBuf,

    /// Client-request feed.
    pub requests_file: PathBuf,

    /// Optional lookup tables; the built-in tables are used when unset.
    pub lookup_file: Option<PathBuf>,

    /// Spacing between client requests.
    pub request_interval: Duration,

    /// Delay after the replication server starts before uploads are fed,
    /// so peers are listening when the first broadcast goes out.
    pub peer_warmup: Duration,

    /// Delay before the request feed starts, counted after `peer_warmup`.
    pub startup_delay: Duration,

    /// Interval between memory-usage reports.
    pub memstats_interval: Duration,

    /// Docker CLI binary.
    pub docker_bin: String,

    /// Swarm placement attribute matched against the target node.
    pub constraint_key: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            peers: Vec::new(),
            rpc_timeout: Duration::from_millis(1000),
            replication_attempts: 3,
            queue_capacity: 10,
            max_in_flight: 64,
            poll_base: Duration::from_millis(50),
            poll_max: Duration::from_millis(2000),
            resources_file: PathBuf::from("input.json"),
            requests_file: PathBuf::from("clientrequest.json"),
            lookup_file: None,
            request_interval: Duration::from_millis(3000),
            peer_warmup: Duration::from_millis(4000),
            startup_delay: Duration::from_millis(2000),
            memstats_interval: Duration::from_secs(1),
            docker_bin: "docker".to_string(),
            constraint_key: "node.hostname".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `EDGEPLACE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup. Keys carry the `EDGEPLACE_` prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let peers = get("PEERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            node_id: get("NODE_ID").unwrap_or(defaults.node_id),
            listen_addr: parse(&get, "LISTEN_ADDR")?.unwrap_or(defaults.listen_addr),
            peers,
            rpc_timeout: millis(&get, "RPC_TIMEOUT_MS")?.unwrap_or(defaults.rpc_timeout),
            replication_attempts: parse(&get, "REPLICATION_ATTEMPTS")?
                .unwrap_or(defaults.replication_attempts)
                .max(1),
            queue_capacity: parse(&get, "QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity)
                .max(1),
            max_in_flight: parse(&get, "MAX_IN_FLIGHT")?
                .unwrap_or(defaults.max_in_flight)
                .max(1),
            poll_base: millis(&get, "POLL_BASE_MS")?.unwrap_or(defaults.poll_base),
            poll_max: millis(&get, "POLL_MAX_MS")?.unwrap_or(defaults.poll_max),
            resources_file: get("RESOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.resources_file),
            requests_file: get("REQUESTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.requests_file),
            lookup_file: get("LOOKUP_FILE").map(PathBuf::from),
            request_interval: millis(&get, "REQUEST_INTERVAL_MS")?
                .unwrap_or(defaults.request_interval),
            peer_warmup: millis(&get, "PEER_WARMUP_MS")?.unwrap_or(defaults.peer_warmup),
            startup_delay: millis(&get, "STARTUP_DELAY_MS")?.unwrap_or(defaults.startup_delay),
            memstats_interval: parse::<u64>(&get, "MEMSTATS_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.memstats_interval),
            docker_bin: get("DOCKER_BIN").unwrap_or(defaults.docker_bin),
            constraint_key: get("CONSTRAINT_KEY").unwrap_or(defaults.constraint_key),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Backoff used by task completion polling and resource-version monitoring.
    pub fn poll_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.poll_base,
            max: self.poll_max.max(self.poll_base),
            ..BackoffPolicy::default()
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(name)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid {ENV_PREFIX}{name}: '{raw}'"))
        })
        .transpose()
}

fn millis(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(get, name)?.map(Duration::from_millis))
}
