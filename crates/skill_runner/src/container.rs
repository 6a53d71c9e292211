//! The containerisation backend is an opaque collaborator: the runner
//! only needs network existence/creation and the ability to run and kill
//! a single container. Production deployments back this with the local
//! container engine; tests use an in-memory double.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ContainerRunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("run error: {0}")]
    Run(String),
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn network_exists(&self, name: &str) -> Result<bool, ContainerError>;

    /// Creates the named network. `internal` true means no route to the
    /// host's public internet; all egress goes through the broker.
    async fn network_create(&self, name: &str, internal: bool) -> Result<(), ContainerError>;

    async fn run_container(
        &self,
        image: &str,
        name: &str,
        network: &str,
        memory_limit: &str,
        cpu_limit: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ContainerRunOutcome, ContainerError>;

    async fn kill(&self, name: &str) -> Result<(), ContainerError>;
}

/// In-memory double used by tests and by `local` mode callers who want to
/// exercise the container-mode code path without a real engine.
pub struct FakeContainerBackend {
    pub networks: parking_lot::Mutex<std::collections::HashSet<String>>,
    pub outcome: ContainerRunOutcome,
}

impl FakeContainerBackend {
    pub fn new(outcome: ContainerRunOutcome) -> Self {
        Self { networks: parking_lot::Mutex::new(std::collections::HashSet::new()), outcome }
    }
}

#[async_trait]
impl ContainerBackend for FakeContainerBackend {
    async fn network_exists(&self, name: &str) -> Result<bool, ContainerError> {
        Ok(self.networks.lock().contains(name))
    }

    async fn network_create(&self, name: &str, _internal: bool) -> Result<(), ContainerError> {
        self.networks.lock().insert(name.to_string());
        Ok(())
    }

    async fn run_container(
        &self,
        _image: &str,
        _name: &str,
        _network: &str,
        _memory_limit: &str,
        _cpu_limit: &str,
        _env: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<ContainerRunOutcome, ContainerError> {
        Ok(self.outcome.clone())
    }

    async fn kill(&self, _name: &str) -> Result<(), ContainerError> {
        Ok(())
    }
}
