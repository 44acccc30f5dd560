//! Dependency-gated startup.
//!
//! Every service gets its own task. A task waits on the readiness board
//! until each dependency reports its condition, then starts the service and
//! publishes its state. Long-running services with a probe are only marked
//! healthy once the probe passes; one-shot jobs are retried per policy. A
//! dependency that fails makes its dependents fail without starting them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compose::{Deployment, RestartPolicy, ServiceSpec};
use crate::error::{ManifestError, RuntimeError};
use crate::metrics::MetricsCollector;
use crate::probe::{monitor, wait_until_healthy, HealthVerdict, ProbeAttempt};
use crate::runtime::{RuntimeProbe, ServiceRuntime};

use super::graph::{DependencyGraph, Edge};
use super::job::{backoff, JobRecord};
use super::readiness::{EventKind, ReadinessBoard, SequenceEvent, ServiceState, WaitError};

/// Errors that can occur while sequencing a deployment.
#[derive(Debug, Error)]
pub enum SequencerError {
    /// The manifest failed validation.
    #[error("Invalid deployment: {0}")]
    Manifest(#[from] ManifestError),

    /// The runtime could not prepare shared resources.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// `run` was called while a run is in progress.
    #[error("Sequencer is already running")]
    AlreadyRunning,

    /// Services did not stop in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the sequencer.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Upper bound on attempts for every one-shot job.
    pub max_job_attempts: Option<u32>,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Longest retry delay.
    pub backoff_cap: Duration,
    /// Grace time given to each service when stopping.
    pub stop_timeout: Duration,
    /// Time allowed for stopping the whole deployment.
    pub shutdown_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_job_attempts: None,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(120),
        }
    }
}

impl SequencerConfig {
    /// Bounds the attempts of every one-shot job.
    pub fn with_max_job_attempts(mut self, attempts: u32) -> Self {
        self.max_job_attempts = Some(attempts);
        self
    }

    /// Sets the retry backoff.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Sets the per-service stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Sets the overall shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Why a service did not reach its target state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ServiceFailure {
    /// A dependency can no longer satisfy its condition.
    DependencyFailed {
        dependency: String,
        state: ServiceState,
    },
    /// The runtime could not start the service.
    StartFailed { message: String },
    /// The probe never passed within its retries.
    Unhealthy { attempts: u32, reason: String },
    /// A one-shot job ran out of attempts.
    JobFailed { attempts: u32, exit_code: i64 },
    /// Shutdown was requested first.
    Cancelled,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceFailure::DependencyFailed { dependency, state } => {
                write!(f, "dependency '{}' is {}", dependency, state)
            }
            ServiceFailure::StartFailed { message } => write!(f, "start failed: {}", message),
            ServiceFailure::Unhealthy { attempts, reason } => {
                write!(f, "unhealthy after {} probes: {}", attempts, reason)
            }
            ServiceFailure::JobFailed {
                attempts,
                exit_code,
            } => write!(f, "exited with code {} after {} attempts", exit_code, attempts),
            ServiceFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final result for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub name: String,
    pub state: ServiceState,
    /// Start attempts (jobs) or probe attempts (services).
    pub attempts: u32,
    pub exit_code: Option<i64>,
    pub failure: Option<ServiceFailure>,
    /// Time from `run` until the service settled.
    pub elapsed: Duration,
}

impl ServiceOutcome {
    fn new(name: &str, state: ServiceState, started: Instant) -> Self {
        Self {
            name: name.to_string(),
            state,
            attempts: 0,
            exit_code: None,
            failure: None,
            elapsed: started.elapsed(),
        }
    }

    fn failed(name: &str, state: ServiceState, failure: ServiceFailure, started: Instant) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(name, state, started)
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of bringing a deployment up.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub services: BTreeMap<String, ServiceOutcome>,
    pub events: Vec<SequenceEvent>,
}

impl DeploymentReport {
    /// True when every service reached its target state.
    pub fn succeeded(&self) -> bool {
        self.services.values().all(ServiceOutcome::is_success)
    }

    /// Services that did not reach their target state.
    pub fn failures(&self) -> Vec<&ServiceOutcome> {
        self.services.values().filter(|o| !o.is_success()).collect()
    }

    /// Outcome for one service.
    pub fn outcome(&self, service: &str) -> Option<&ServiceOutcome> {
        self.services.get(service)
    }

    /// Plain-text summary, one line per service.
    pub fn summary(&self) -> String {
        let width = self.services.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::new();
        for outcome in self.services.values() {
            let detail = outcome
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            out.push_str(&format!(
                "{:width$}  {:10} {}\n",
                outcome.name,
                outcome.state.to_string(),
                detail,
                width = width
            ));
        }
        out
    }
}

/// State shared by the sequencer and its service tasks.
struct Shared {
    deployment: Arc<Deployment>,
    runtime: Arc<dyn ServiceRuntime>,
    board: Arc<ReadinessBoard>,
    config: SequencerConfig,
    started: Mutex<Vec<String>>,
    stopping: AtomicBool,
    metrics: MetricsCollector,
}

impl Shared {
    fn started(&self) -> MutexGuard<'_, Vec<String>> {
        match self.started.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_started(&self, name: &str) {
        let mut started = self.started();
        if !started.iter().any(|s| s == name) {
            started.push(name.to_string());
        }
    }

    fn probe_observer<'a>(&'a self, name: &'a str) -> impl FnMut(&ProbeAttempt) + Send + 'a {
        move |attempt: &ProbeAttempt| {
            if !attempt.success {
                self.board.record(
                    name,
                    EventKind::ProbeFailed {
                        attempt: attempt.attempt,
                        consecutive: attempt.consecutive_failures,
                        reason: attempt.reason.clone(),
                    },
                );
            }
        }
    }
}

/// Brings a deployment up in dependency order.
pub struct Sequencer {
    shared: Arc<Shared>,
    graph: DependencyGraph,
    shutdown_tx: broadcast::Sender<()>,
    is_running: AtomicBool,
}

impl Sequencer {
    /// Creates a sequencer, validating the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns `SequencerError::Manifest` for unknown dependencies, cycles, or
    /// health conditions on services without a probe.
    pub fn new(
        deployment: Deployment,
        runtime: Arc<dyn ServiceRuntime>,
        config: SequencerConfig,
    ) -> Result<Self, SequencerError> {
        let graph = DependencyGraph::from_deployment(&deployment)?;
        let board = Arc::new(ReadinessBoard::new(graph.services()));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            shared: Arc::new(Shared {
                deployment: Arc::new(deployment),
                runtime,
                board,
                config,
                started: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                metrics: MetricsCollector::new(),
            }),
            graph,
            shutdown_tx,
            is_running: AtomicBool::new(false),
        })
    }

    /// The readiness board, for observing states while a run is in progress.
    pub fn board(&self) -> Arc<ReadinessBoard> {
        Arc::clone(&self.shared.board)
    }

    /// The validated dependency graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Services started so far, in start order.
    pub fn started_services(&self) -> Vec<String> {
        self.shared.started().clone()
    }

    /// Starts every service and returns once startup has settled: each
    /// service reached its target state, failed, or was cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only if the run could not begin. Service failures
    /// are reported in the `DeploymentReport`.
    pub async fn run(&self) -> Result<DeploymentReport, SequencerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SequencerError::AlreadyRunning);
        }

        let result = self.run_inner().await;
        self.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> Result<DeploymentReport, SequencerError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        info!(
            run_id = %run_id,
            project = %self.shared.deployment.project(),
            runtime = %self.shared.runtime.name(),
            services = self.graph.len(),
            "Starting deployment"
        );
        self.shared.runtime.prepare(&self.shared.deployment).await?;

        let mut tasks = JoinSet::new();
        for name in self.graph.flat_order() {
            let Some(spec) = self.shared.deployment.service(&name).cloned() else {
                continue;
            };
            let edges = self.graph.dependencies(&name).to_vec();
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shutdown_tx.subscribe();

            tasks.spawn(run_service(shared, name, spec, edges, shutdown, started));
        }

        let mut services = BTreeMap::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => {
                    services.insert(outcome.name.clone(), outcome);
                }
                Err(e) => error!(error = %e, "Service task panicked"),
            }
        }

        // A panicked task leaves its service without an outcome
        for name in self.graph.services() {
            if !services.contains_key(name) {
                self.shared.board.set(name, ServiceState::Failed);
                services.insert(
                    name.to_string(),
                    ServiceOutcome::failed(
                        name,
                        ServiceState::Failed,
                        ServiceFailure::StartFailed {
                            message: "service task panicked".to_string(),
                        },
                        started,
                    ),
                );
            }
        }

        let elapsed = started.elapsed();
        self.shared.metrics.record_startup(elapsed);

        let report = DeploymentReport {
            run_id,
            started_at,
            elapsed,
            services,
            events: self.shared.board.events(),
        };

        if report.succeeded() {
            info!(run_id = %run_id, elapsed_ms = elapsed.as_millis() as u64, "Deployment is up");
        } else {
            error!(
                run_id = %run_id,
                failed = report.failures().len(),
                "Deployment did not come up"
            );
        }

        Ok(report)
    }

    /// Watches long-running services until shutdown, restarting a service
    /// that exits or turns unhealthy when its restart policy allows.
    pub async fn supervise(&self) {
        let mut tasks = JoinSet::new();

        for name in self.shared.started().clone() {
            let Some(spec) = self.shared.deployment.service(&name).cloned() else {
                continue;
            };
            if spec.is_one_shot() {
                continue;
            }
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shutdown_tx.subscribe();
            tasks.spawn(supervise_service(shared, name, spec, shutdown));
        }

        info!(services = tasks.len(), "Supervising services");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Supervisor task panicked");
            }
        }
    }

    /// Cancels in-flight probes and jobs, then stops started services in
    /// reverse start order.
    ///
    /// # Errors
    ///
    /// Returns `SequencerError::ShutdownTimeout` if stopping takes longer
    /// than the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), SequencerError> {
        info!("Initiating deployment shutdown");
        self.shared.stopping.store(true, Ordering::SeqCst);

        // Ignore send error - no task may be listening
        let _ = self.shutdown_tx.send(());

        let order = self.shared.started().clone();
        let shared = Arc::clone(&self.shared);
        let stop_all = async move {
            for name in order.iter().rev() {
                match shared.runtime.stop(name, shared.config.stop_timeout).await {
                    Ok(()) => {
                        shared.board.record(name, EventKind::Stopped);
                        debug!(service = %name, "Stopped");
                    }
                    Err(e) => warn!(service = %name, error = %e, "Failed to stop service"),
                }
            }
        };

        let timeout = self.shared.config.shutdown_timeout;
        match tokio::time::timeout(timeout, stop_all).await {
            Ok(()) => {
                info!("Deployment stopped");
                Ok(())
            }
            Err(_) => Err(SequencerError::ShutdownTimeout(timeout)),
        }
    }
}

async fn run_service(
    shared: Arc<Shared>,
    name: String,
    spec: ServiceSpec,
    edges: Vec<Edge>,
    mut shutdown: broadcast::Receiver<()>,
    started: Instant,
) -> ServiceOutcome {
    for edge in &edges {
        debug!(service = %name, dependency = %edge.dependency, condition = %edge.condition, "Waiting");
        match shared
            .board
            .wait_for(&edge.dependency, edge.condition, &mut shutdown)
            .await
        {
            Ok(()) => {}
            Err(WaitError::Cancelled) => {
                return ServiceOutcome::failed(&name, ServiceState::Pending, ServiceFailure::Cancelled, started)
            }
            Err(WaitError::Unsatisfiable(state)) => {
                warn!(
                    service = %name,
                    dependency = %edge.dependency,
                    dependency_state = %state,
                    "Dependency failed, not starting"
                );
                shared.board.record(
                    &name,
                    EventKind::DependencyFailed {
                        dependency: edge.dependency.clone(),
                        state,
                    },
                );
                shared.board.set(&name, ServiceState::Failed);
                return ServiceOutcome::failed(
                    &name,
                    ServiceState::Failed,
                    ServiceFailure::DependencyFailed {
                        dependency: edge.dependency.clone(),
                        state,
                    },
                    started,
                );
            }
        }
    }

    if spec.is_one_shot() {
        run_job(&shared, &name, &spec, &mut shutdown, started).await
    } else {
        run_long_running(&shared, &name, &spec, &mut shutdown, started).await
    }
}

async fn run_long_running(
    shared: &Shared,
    name: &str,
    spec: &ServiceSpec,
    shutdown: &mut broadcast::Receiver<()>,
    started: Instant,
) -> ServiceOutcome {
    info!(service = %name, "Starting service");
    if let Err(e) = shared.runtime.start(name, spec).await {
        error!(service = %name, error = %e, "Failed to start service");
        shared.board.set(name, ServiceState::Failed);
        return ServiceOutcome::failed(
            name,
            ServiceState::Failed,
            ServiceFailure::StartFailed {
                message: e.to_string(),
            },
            started,
        );
    }
    shared.mark_started(name);

    let Some(healthcheck) = spec.probe() else {
        shared.board.set(name, ServiceState::Running);
        return ServiceOutcome::new(name, ServiceState::Running, started);
    };

    shared.board.set(name, ServiceState::Starting);
    let executor = RuntimeProbe::new(Arc::clone(&shared.runtime));
    let verdict = wait_until_healthy(
        &executor,
        name,
        healthcheck,
        shutdown,
        shared.probe_observer(name),
    )
    .await;

    match verdict {
        HealthVerdict::Healthy { attempts } => {
            shared.board.set(name, ServiceState::Healthy);
            ServiceOutcome {
                attempts,
                ..ServiceOutcome::new(name, ServiceState::Healthy, started)
            }
        }
        HealthVerdict::Unhealthy {
            attempts,
            last_reason,
        } => {
            error!(
                service = %name,
                attempts = attempts,
                reason = %last_reason,
                "Service never became healthy"
            );
            shared.board.set(name, ServiceState::Unhealthy);
            ServiceOutcome {
                attempts,
                ..ServiceOutcome::failed(
                    name,
                    ServiceState::Unhealthy,
                    ServiceFailure::Unhealthy {
                        attempts,
                        reason: last_reason,
                    },
                    started,
                )
            }
        }
        HealthVerdict::Cancelled => {
            ServiceOutcome::failed(name, ServiceState::Starting, ServiceFailure::Cancelled, started)
        }
    }
}

async fn run_job(
    shared: &Shared,
    name: &str,
    spec: &ServiceSpec,
    shutdown: &mut broadcast::Receiver<()>,
    started: Instant,
) -> ServiceOutcome {
    let mut job = JobRecord::from_spec(name, spec, shared.config.max_job_attempts);

    loop {
        let attempt = job.begin_attempt();
        shared.board.record(name, EventKind::JobAttempt { attempt });
        info!(service = %name, attempt = attempt, command = %job.command, "Running job");

        let exit_code = match shared.runtime.start(name, spec).await {
            Ok(()) => {
                shared.mark_started(name);
                shared.board.set(name, ServiceState::Running);
                tokio::select! {
                    result = shared.runtime.wait_exit(name) => match result {
                        Ok(code) => code,
                        Err(e) => {
                            warn!(service = %name, error = %e, "Lost track of job");
                            -1
                        }
                    },
                    _ = shutdown.recv() => {
                        return ServiceOutcome {
                            attempts: attempt,
                            ..ServiceOutcome::failed(name, ServiceState::Running, ServiceFailure::Cancelled, started)
                        };
                    }
                }
            }
            Err(e) => {
                warn!(service = %name, attempt = attempt, error = %e, "Failed to start job");
                -1
            }
        };

        job.finish_attempt(exit_code);
        shared.board.record(name, EventKind::JobExited { attempt, exit_code });
        shared.metrics.record_job_attempt(name, exit_code == 0);

        if exit_code == 0 {
            info!(service = %name, attempt = attempt, "Job completed");
            shared.board.set(name, ServiceState::Completed);
            return ServiceOutcome {
                attempts: attempt,
                exit_code: Some(0),
                ..ServiceOutcome::new(name, ServiceState::Completed, started)
            };
        }

        if !job.should_retry() {
            error!(
                service = %name,
                attempts = attempt,
                exit_code = exit_code,
                "Job failed, no attempts left"
            );
            shared.board.set(name, ServiceState::Failed);
            return ServiceOutcome {
                attempts: attempt,
                exit_code: Some(exit_code),
                ..ServiceOutcome::failed(
                    name,
                    ServiceState::Failed,
                    ServiceFailure::JobFailed {
                        attempts: attempt,
                        exit_code,
                    },
                    started,
                )
            };
        }

        let delay = backoff(attempt, shared.config.backoff_base, shared.config.backoff_cap);
        warn!(
            service = %name,
            attempt = attempt,
            exit_code = exit_code,
            remaining_attempts = ?job.remaining_attempts(),
            retry_in_ms = delay.as_millis() as u64,
            "Job failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                return ServiceOutcome {
                    attempts: attempt,
                    exit_code: Some(exit_code),
                    ..ServiceOutcome::failed(name, ServiceState::Running, ServiceFailure::Cancelled, started)
                };
            }
        }
    }
}

/// Something wrong with a supervised service.
enum Trouble {
    Exited(i64),
    Unhealthy(String),
}

fn restart_allowed(policy: RestartPolicy, trouble: &Trouble, restarts: u32) -> bool {
    match policy {
        RestartPolicy::No => false,
        RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
        RestartPolicy::OnFailure { max_attempts } => {
            !matches!(trouble, Trouble::Exited(0)) && max_attempts.map_or(true, |max| restarts < max)
        }
    }
}

async fn watch_service(
    shared: &Shared,
    name: &str,
    spec: &ServiceSpec,
    shutdown: &mut broadcast::Receiver<()>,
) -> Option<Trouble> {
    let exit = async {
        match shared.runtime.wait_exit(name).await {
            Ok(code) => code,
            Err(_) => -1,
        }
    };

    match spec.probe() {
        Some(healthcheck) => {
            let executor = RuntimeProbe::new(Arc::clone(&shared.runtime));
            tokio::select! {
                verdict = monitor(&executor, name, healthcheck, shutdown, shared.probe_observer(name)) => match verdict {
                    HealthVerdict::Unhealthy { last_reason, .. } => Some(Trouble::Unhealthy(last_reason)),
                    _ => None,
                },
                code = exit => Some(Trouble::Exited(code)),
            }
        }
        None => tokio::select! {
            code = exit => Some(Trouble::Exited(code)),
            _ = shutdown.recv() => None,
        },
    }
}

async fn supervise_service(
    shared: Arc<Shared>,
    name: String,
    spec: ServiceSpec,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut restarts = 0u32;
    let mut pending: Option<Trouble> = None;

    loop {
        let trouble = match pending.take() {
            Some(trouble) => trouble,
            None => match watch_service(&shared, &name, &spec, &mut shutdown).await {
                Some(trouble) => trouble,
                None => return,
            },
        };

        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }

        match trouble {
            Trouble::Exited(code) => {
                warn!(service = %name, exit_code = code, "Service exited");
                shared.board.set(&name, ServiceState::Failed);
            }
            Trouble::Unhealthy(ref reason) => {
                warn!(service = %name, reason = %reason, "Service became unhealthy");
                shared.board.set(&name, ServiceState::Unhealthy);
            }
        }

        if !restart_allowed(spec.restart, &trouble, restarts) {
            warn!(service = %name, policy = %spec.restart, "Restart policy does not allow a restart");
            return;
        }

        restarts += 1;
        let delay = backoff(restarts, shared.config.backoff_base, shared.config.backoff_cap);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }

        info!(service = %name, restart = restarts, "Restarting service");
        if let Err(e) = shared.runtime.start(&name, &spec).await {
            error!(service = %name, error = %e, "Restart failed");
            pending = Some(Trouble::Exited(-1));
            continue;
        }
        shared.board.record(&name, EventKind::Restarted { attempt: restarts });
        shared.metrics.record_restart(&name);

        let Some(healthcheck) = spec.probe() else {
            shared.board.set(&name, ServiceState::Running);
            continue;
        };

        shared.board.set(&name, ServiceState::Starting);
        let executor = RuntimeProbe::new(Arc::clone(&shared.runtime));
        match wait_until_healthy(
            &executor,
            &name,
            healthcheck,
            &mut shutdown,
            shared.probe_observer(&name),
        )
        .await
        {
            HealthVerdict::Healthy { .. } => shared.board.set(&name, ServiceState::Healthy),
            HealthVerdict::Unhealthy { last_reason, .. } => {
                pending = Some(Trouble::Unhealthy(last_reason));
            }
            HealthVerdict::Cancelled => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ProbeTest;
    use crate::probe::ProbeOutcome;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    /// In-memory runtime: jobs exit with scripted codes, probes follow a
    /// per-service health flag.
    #[derive(Default)]
    struct FakeRuntime {
        exit_codes: Mutex<HashMap<String, Vec<i64>>>,
        healthy: Mutex<HashMap<String, bool>>,
        starts: Mutex<Vec<String>>,
        stops: Mutex<Vec<String>>,
        probe_calls: AtomicU32,
        never_exit: Notify,
    }

    impl FakeRuntime {
        fn with_exit_codes(self, service: &str, codes: &[i64]) -> Self {
            self.exit_codes
                .lock()
                .unwrap()
                .insert(service.to_string(), codes.to_vec());
            self
        }

        fn with_health(self, service: &str, healthy: bool) -> Self {
            self.healthy.lock().unwrap().insert(service.to_string(), healthy);
            self
        }

        fn starts(&self) -> Vec<String> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceRuntime for FakeRuntime {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start(&self, name: &str, _spec: &ServiceSpec) -> Result<(), RuntimeError> {
            self.starts.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn wait_exit(&self, name: &str) -> Result<i64, RuntimeError> {
            let code = {
                let mut codes = self.exit_codes.lock().unwrap();
                codes.get_mut(name).and_then(|c| {
                    if c.len() > 1 {
                        Some(c.remove(0))
                    } else {
                        c.first().copied()
                    }
                })
            };
            match code {
                Some(code) => Ok(code),
                None => {
                    self.never_exit.notified().await;
                    Ok(0)
                }
            }
        }

        async fn probe(
            &self,
            name: &str,
            _test: &ProbeTest,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, RuntimeError> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            let healthy = self.healthy.lock().unwrap().get(name).copied().unwrap_or(false);
            Ok(ProbeOutcome::exited(if healthy { 0 } else { 1 }, ""))
        }

        async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), RuntimeError> {
            self.stops.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    const MANIFEST: &str = r#"
services:
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 10ms
      timeout: 50ms
      retries: 3
      start_period: 0s
  init:
    image: airflow
    command: flightdeck init
    restart: on-failure
    x-lifecycle: one-shot
    depends_on:
      db:
        condition: service_healthy
  web:
    image: airflow
    depends_on:
      init:
        condition: service_completed_successfully
"#;

    fn deployment() -> Deployment {
        Deployment::from_yaml(MANIFEST, &BTreeMap::new()).unwrap()
    }

    fn fast_config() -> SequencerConfig {
        SequencerConfig::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn position(events: &[SequenceEvent], service: &str, state: ServiceState) -> Option<u64> {
        events
            .iter()
            .find(|e| {
                e.service == service
                    && matches!(e.kind, EventKind::StateChanged { to, .. } if to == state)
            })
            .map(|e| e.seq)
    }

    #[tokio::test]
    async fn test_healthy_chain_starts_in_order() {
        let runtime = Arc::new(
            FakeRuntime::default()
                .with_health("db", true)
                .with_exit_codes("init", &[0]),
        );
        let sequencer = Sequencer::new(deployment(), runtime.clone(), fast_config()).unwrap();

        let report = sequencer.run().await.unwrap();

        assert!(report.succeeded(), "{}", report.summary());
        assert_eq!(runtime.starts(), vec!["db", "init", "web"]);
        assert_eq!(report.outcome("db").unwrap().state, ServiceState::Healthy);
        assert_eq!(report.outcome("init").unwrap().state, ServiceState::Completed);
        assert_eq!(report.outcome("web").unwrap().state, ServiceState::Running);

        let healthy = position(&report.events, "db", ServiceState::Healthy).unwrap();
        let init_running = position(&report.events, "init", ServiceState::Running).unwrap();
        assert!(healthy < init_running);
    }

    #[tokio::test]
    async fn test_unhealthy_dependency_blocks_dependents() {
        let runtime = Arc::new(FakeRuntime::default().with_health("db", false));
        let sequencer = Sequencer::new(deployment(), runtime.clone(), fast_config()).unwrap();

        let report = sequencer.run().await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(runtime.starts(), vec!["db"]);
        assert_eq!(runtime.probe_calls.load(Ordering::SeqCst), 3);

        let db = report.outcome("db").unwrap();
        assert_eq!(db.state, ServiceState::Unhealthy);
        assert!(matches!(db.failure, Some(ServiceFailure::Unhealthy { attempts: 3, .. })));

        let init = report.outcome("init").unwrap();
        assert_eq!(
            init.failure,
            Some(ServiceFailure::DependencyFailed {
                dependency: "db".to_string(),
                state: ServiceState::Unhealthy
            })
        );
        let web = report.outcome("web").unwrap();
        assert_eq!(web.state, ServiceState::Failed);
        assert!(matches!(web.failure, Some(ServiceFailure::DependencyFailed { ref dependency, .. }) if dependency == "init"));
    }

    #[tokio::test]
    async fn test_job_retried_until_success() {
        let runtime = Arc::new(
            FakeRuntime::default()
                .with_health("db", true)
                .with_exit_codes("init", &[1, 2, 0]),
        );
        let sequencer = Sequencer::new(deployment(), runtime.clone(), fast_config()).unwrap();

        let report = sequencer.run().await.unwrap();

        assert!(report.succeeded());
        let init = report.outcome("init").unwrap();
        assert_eq!(init.attempts, 3);
        assert_eq!(init.exit_code, Some(0));

        let exits: Vec<i64> = report
            .events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::JobExited { exit_code, .. } if e.service == "init" => Some(exit_code),
                _ => None,
            })
            .collect();
        assert_eq!(exits, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_job_attempts_bounded_by_cap() {
        let runtime = Arc::new(
            FakeRuntime::default()
                .with_health("db", true)
                .with_exit_codes("init", &[1]),
        );
        let config = fast_config().with_max_job_attempts(4);
        let sequencer = Sequencer::new(deployment(), runtime.clone(), config).unwrap();

        let report = sequencer.run().await.unwrap();

        assert!(!report.succeeded());
        let init = report.outcome("init").unwrap();
        assert_eq!(
            init.failure,
            Some(ServiceFailure::JobFailed {
                attempts: 4,
                exit_code: 1
            })
        );
        assert!(!runtime.starts().contains(&"web".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_stops_in_reverse() {
        // db never becomes healthy and its probe budget is large
        let yaml = MANIFEST.replace("retries: 3", "retries: 100000");
        let deployment = Deployment::from_yaml(&yaml, &BTreeMap::new()).unwrap();
        let runtime = Arc::new(FakeRuntime::default().with_health("db", false));
        let sequencer = Arc::new(Sequencer::new(deployment, runtime.clone(), fast_config()).unwrap());

        let runner = Arc::clone(&sequencer);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        sequencer.shutdown().await.unwrap();

        let report = handle.await.unwrap().unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.outcome("db").unwrap().failure, Some(ServiceFailure::Cancelled));
        assert_eq!(report.outcome("web").unwrap().failure, Some(ServiceFailure::Cancelled));
        assert_eq!(runtime.stops.lock().unwrap().clone(), vec!["db"]);
    }

    #[tokio::test]
    async fn test_run_twice_concurrently_rejected() {
        let runtime = Arc::new(FakeRuntime::default().with_health("db", true).with_exit_codes("init", &[0]));
        let sequencer = Sequencer::new(deployment(), runtime, fast_config()).unwrap();
        sequencer.is_running.store(true, Ordering::SeqCst);
        assert!(matches!(sequencer.run().await, Err(SequencerError::AlreadyRunning)));
    }

    #[test]
    fn test_invalid_graph_rejected() {
        let yaml = "services:\n  a:\n    image: x\n    depends_on: [b]\n";
        let deployment = Deployment::from_yaml(yaml, &BTreeMap::new()).unwrap();
        let result = Sequencer::new(deployment, Arc::new(FakeRuntime::default()), SequencerConfig::default());
        assert!(matches!(result, Err(SequencerError::Manifest(ManifestError::UnknownDependency { .. }))));
    }

    #[test]
    fn test_restart_allowed() {
        let on_failure = RestartPolicy::OnFailure { max_attempts: Some(2) };
        assert!(restart_allowed(on_failure, &Trouble::Exited(1), 0));
        assert!(!restart_allowed(on_failure, &Trouble::Exited(1), 2));
        assert!(!restart_allowed(on_failure, &Trouble::Exited(0), 0));
        assert!(restart_allowed(RestartPolicy::Always, &Trouble::Exited(0), 50));
        assert!(restart_allowed(RestartPolicy::UnlessStopped, &Trouble::Unhealthy("x".into()), 1));
        assert!(!restart_allowed(RestartPolicy::No, &Trouble::Unhealthy("x".into()), 0));
    }

    #[test]
    fn test_report_summary() {
        let started = Instant::now();
        let mut services = BTreeMap::new();
        services.insert("db".to_string(), ServiceOutcome::new("db", ServiceState::Healthy, started));
        services.insert(
            "init".to_string(),
            ServiceOutcome::failed(
                "init",
                ServiceState::Failed,
                ServiceFailure::JobFailed { attempts: 2, exit_code: 3 },
                started,
            ),
        );
        let report = DeploymentReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            services,
            events: Vec::new(),
        };

        assert!(!report.succeeded());
        assert_eq!(report.failures().len(), 1);
        let summary = report.summary();
        assert!(summary.contains("healthy"));
        assert!(summary.contains("exited with code 3 after 2 attempts"));
    }
}
