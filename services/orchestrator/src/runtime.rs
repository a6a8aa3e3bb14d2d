//! Container runtime interface and implementations.
//!
//! The runtime interface abstracts the two operations the task lifecycle
//! needs from a container orchestrator:
//! - Creating a one-shot service pinned to a node
//! - Querying a service's status
//!
//! `DockerSwarmRuntime` drives the `docker` CLI; `MockRuntime` is provided
//! for testing and development.

use std::collections::HashMap;
use std::process::Output;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Substring of a status report that means the service has finished.
pub const COMPLETED_MARKER: &str = "Complete";

/// Returns true if a status report denotes completion.
pub fn is_completed(status: &str) -> bool {
    status.contains(COMPLETED_MARKER)
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime command could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The runtime command ran and reported failure.
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Rejected by a mock or test runtime.
    #[error("runtime rejected request: {0}")]
    Rejected(String),
}

/// What to launch and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service name; the client request that triggered the launch.
    pub name: String,
    /// Application image.
    pub image: String,
    /// Node the service must run on.
    pub placement_constraint: String,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Submit a service. Returns the runtime's output (typically the service ID).
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, RuntimeError>;

    /// Current status report for a service.
    async fn service_status(&self, name: &str) -> Result<String, RuntimeError>;
}

// =============================================================================
// Docker Swarm
// =============================================================================

/// Runtime backed by `docker service` commands against a swarm manager.
#[derive(Debug, Clone)]
pub struct DockerSwarmRuntime {
    docker_bin: String,
    constraint_key: String,
}

impl DockerSwarmRuntime {
    /// Create a runtime invoking `docker_bin`, constraining placement on
    /// `constraint_key` (e.g. `node.hostname`).
    pub fn new(docker_bin: impl Into<String>, constraint_key: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            constraint_key: constraint_key.into(),
        }
    }

    /// Arguments for `docker service create`.
    pub fn create_args(&self, spec: &ServiceSpec) -> Vec<String> {
        vec![
            "service".to_string(),
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--restart-condition".to_string(),
            "none".to_string(),
            "--detach".to_string(),
            "--constraint".to_string(),
            format!("{}=={}", self.constraint_key, spec.placement_constraint),
            spec.image.clone(),
        ]
    }

    /// Arguments for `docker service ps`.
    pub fn status_args(&self, name: &str) -> Vec<String> {
        vec!["service".to_string(), "ps".to_string(), name.to_string()]
    }

    async fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        let command = format!("{} {}", self.docker_bin, args.join(" "));
        debug!(command = %command, "Running container runtime command");

        let output: Output = Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerSwarmRuntime {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, RuntimeError> {
        info!(
            service = %spec.name,
            image = %spec.image,
            constraint = %spec.placement_constraint,
            "Creating service"
        );
        let output = self.run(&self.create_args(spec)).await?;
        Ok(output.trim().to_string())
    }

    async fn service_status(&self, name: &str) -> Result<String, RuntimeError> {
        self.run(&self.status_args(name)).await
    }
}

// =============================================================================
// Mock
// =============================================================================

/// Mock runtime for testing and development.
///
/// Every created service reports `Running` until it has been queried
/// `polls_until_complete` times, then reports `Complete`.
pub struct MockRuntime {
    /// Counter for generating service IDs.
    service_counter: AtomicU64,

    /// Whether creates should fail.
    fail_creates: bool,

    /// Status queries before a service completes; `None` never completes.
    polls_until_complete: Option<u32>,

    created: Mutex<Vec<ServiceSpec>>,
    polls: Mutex<HashMap<String, u32>>,
}

impl MockRuntime {
    /// Create a mock runtime whose services complete after three polls.
    pub fn new() -> Self {
        Self::completing_after(3)
    }

    /// Create a mock runtime whose services complete after `polls` queries.
    pub fn completing_after(polls: u32) -> Self {
        Self {
            service_counter: AtomicU64::new(0),
            fail_creates: false,
            polls_until_complete: Some(polls),
            created: Mutex::new(Vec::new()),
            polls: Mutex::new(HashMap::new()),
        }
    }

    /// Create a mock runtime whose services never complete.
    pub fn never_completing() -> Self {
        Self {
            polls_until_complete: None,
            ..Self::new()
        }
    }

    /// Create a mock runtime that fails all creates.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::new()
        }
    }

    /// Specs submitted so far.
    pub fn created(&self) -> Vec<ServiceSpec> {
        self.created.lock().clone()
    }

    /// Number of status queries made for `name`.
    pub fn poll_count(&self, name: &str) -> u32 {
        self.polls.lock().get(name).copied().unwrap_or(0)
    }

    fn next_service_id(&self) -> String {
        let counter = self.service_counter.fetch_add(1, Ordering::SeqCst);
        format!("svc_{:016x}", counter)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, RuntimeError> {
        if self.fail_creates {
            return Err(RuntimeError::Rejected(format!(
                "mock runtime configured to fail ({})",
                spec.name
            )));
        }

        debug!(service = %spec.name, node = %spec.placement_constraint, "[MOCK] Creating service");
        self.created.lock().push(spec.clone());
        Ok(self.next_service_id())
    }

    async fn service_status(&self, name: &str) -> Result<String, RuntimeError> {
        let polls = {
            let mut polls = self.polls.lock();
            let count = polls.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let done = self
            .polls_until_complete
            .is_some_and(|threshold| polls >= threshold);
        Ok(if done {
            format!("{name}.1  image  node  Shutdown  {COMPLETED_MARKER} 1 second ago")
        } else {
            format!("{name}.1  image  node  Running  Running 1 second ago")
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "req1".to_string(),
            image: "a1".to_string(),
            placement_constraint: "n1".to_string(),
        }
    }

    #[test]
    fn test_docker_create_args() {
        let runtime = DockerSwarmRuntime::new("docker", "node.hostname");
        assert_eq!(
            runtime.create_args(&spec()),
            vec![
                "service",
                "create",
                "--name",
                "req1",
                "--restart-condition",
                "none",
                "--detach",
                "--constraint",
                "node.hostname==n1",
                "a1",
            ]
        );
        assert_eq!(runtime.status_args("req1"), vec!["service", "ps", "req1"]);
    }

    #[tokio::test]
    async fn test_docker_missing_binary_is_spawn_error() {
        let runtime = DockerSwarmRuntime::new("/nonexistent/docker", "node.hostname");
        let err = runtime.create_service(&spec()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[rstest]
    #[case("req1.1 busybox n1 Shutdown Complete 2 seconds ago", true)]
    #[case("req1.1 busybox n1 Running Running 2 seconds ago", false)]
    #[case("req1.1 busybox n1 Shutdown Failed 2 seconds ago", false)]
    #[case("", false)]
    fn test_is_completed(#[case] status: &str, #[case] expected: bool) {
        assert_eq!(is_completed(status), expected);
    }

    #[tokio::test]
    async fn test_mock_completes_after_polls() {
        let runtime = MockRuntime::completing_after(2);
        runtime.create_service(&spec()).await.unwrap();

        assert!(!is_completed(&runtime.service_status("req1").await.unwrap()));
        assert!(is_completed(&runtime.service_status("req1").await.unwrap()));
        assert_eq!(runtime.poll_count("req1"), 2);
        assert_eq!(runtime.created(), vec![spec()]);
    }

    #[tokio::test]
    async fn test_mock_never_completing() {
        let runtime = MockRuntime::never_completing();
        for _ in 0..10 {
            assert!(!is_completed(&runtime.service_status("req1").await.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let runtime = MockRuntime::failing();
        let result = runtime.create_service(&spec()).await;
        assert!(matches!(result, Err(RuntimeError::Rejected(_))));
        assert!(runtime.created().is_empty());
    }
}
