//! Service runtimes.
//!
//! A runtime starts, waits on, probes and stops the services of a
//! deployment. Two implementations are provided:
//! - `DockerRuntime`: containers through the Docker Engine API
//! - `ProcessRuntime`: local processes, for development and tests

pub mod docker;
pub mod process;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::compose::{Deployment, ProbeTest, ServiceSpec};
use crate::error::RuntimeError;
use crate::probe::{ProbeError, ProbeExecutor, ProbeOutcome};

pub use docker::DockerRuntime;
pub use process::ProcessRuntime;

/// Drives the services of one deployment.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Short runtime name for logs.
    fn name(&self) -> &str;

    /// Creates shared resources (networks, volumes) before any service starts.
    async fn prepare(&self, _deployment: &Deployment) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Starts a service. Starting a service that already ran replaces the
    /// previous instance.
    async fn start(&self, name: &str, spec: &ServiceSpec) -> Result<(), RuntimeError>;

    /// Waits for a started service to exit and returns its exit code.
    async fn wait_exit(&self, name: &str) -> Result<i64, RuntimeError>;

    /// Runs a probe against a started service.
    async fn probe(
        &self,
        name: &str,
        test: &ProbeTest,
        timeout: Duration,
    ) -> Result<ProbeOutcome, RuntimeError>;

    /// Stops a service, waiting at most `timeout` before killing it. Stopping
    /// a service that already exited is not an error.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError>;
}

/// Adapts a runtime to the probe executor interface.
#[derive(Clone)]
pub struct RuntimeProbe {
    runtime: Arc<dyn ServiceRuntime>,
}

impl RuntimeProbe {
    pub fn new(runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ProbeExecutor for RuntimeProbe {
    async fn execute(
        &self,
        service: &str,
        test: &ProbeTest,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        Ok(self.runtime.probe(service, test, timeout).await?)
    }
}

/// Resolves the command a service runs: entrypoint followed by command.
pub(crate) fn service_argv(name: &str, spec: &ServiceSpec) -> Result<Vec<String>, RuntimeError> {
    let argv = spec.argv();
    if argv.is_empty() {
        return Err(RuntimeError::NoCommand(name.to_string()));
    }
    Ok(argv)
}
