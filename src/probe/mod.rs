//! Health probes.
//!
//! A probe is a command whose exit status says whether a service is ready.
//! This module runs probes, drives the grace-period/interval/retries state
//! machine, and detects probe commands that can never fail.

use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::broadcast;

use crate::compose::{HealthCheck, ProbeTest};
use crate::metrics::MetricsCollector;

/// Output kept from a probe, in bytes.
const MAX_PROBE_OUTPUT: usize = 4096;

/// Errors that prevent a probe from running at all.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe command is empty")]
    EmptyCommand,

    #[error("Failed to run probe '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::error::RuntimeError),
}

/// Result of a single probe execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Exit code, `None` if the probe timed out or was killed.
    pub exit_code: Option<i64>,
    /// Combined stdout/stderr, truncated.
    pub output: String,
    pub timed_out: bool,
}

impl ProbeOutcome {
    pub fn exited(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: truncate(output.into()),
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            exit_code: None,
            output: String::new(),
            timed_out: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short reason for a failed probe.
    pub fn reason(&self) -> String {
        if self.timed_out {
            return "probe timed out".to_string();
        }
        match self.exit_code {
            Some(code) if self.output.trim().is_empty() => format!("exit code {}", code),
            Some(code) => format!("exit code {}: {}", code, self.output.trim()),
            None => "probe was killed".to_string(),
        }
    }
}

fn truncate(mut output: String) -> String {
    if output.len() > MAX_PROBE_OUTPUT {
        let mut end = MAX_PROBE_OUTPUT;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
    }
    output
}

/// Runs probe commands for a service.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Runs `test` once. A timeout is a failed outcome, not an error.
    async fn execute(
        &self,
        service: &str,
        test: &ProbeTest,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError>;
}

/// Runs probes as local processes.
#[derive(Debug, Clone, Default)]
pub struct LocalProbeExecutor;

impl LocalProbeExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProbeExecutor for LocalProbeExecutor {
    async fn execute(
        &self,
        _service: &str,
        test: &ProbeTest,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let argv = test.argv();
        let (program, args) = argv.split_first().ok_or(ProbeError::EmptyCommand)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                command: test.display(),
                source,
            })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let code = output.status.code().map(i64::from).unwrap_or(-1);
                Ok(ProbeOutcome::exited(code, text))
            }
            Ok(Err(source)) => Err(ProbeError::Spawn {
                command: test.display(),
                source,
            }),
            Err(_) => Ok(ProbeOutcome::timeout()),
        }
    }
}

/// One probe attempt, as reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeAttempt {
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Failures in a row, including this attempt.
    pub consecutive_failures: u32,
    pub success: bool,
    pub reason: String,
}

/// Final verdict of a probe loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy { attempts: u32 },
    Unhealthy { attempts: u32, last_reason: String },
    Cancelled,
}

/// Waits for a service to become healthy.
///
/// Sleeps for `start_period`, then probes every `interval`, each probe
/// bounded by `timeout`. Returns `Unhealthy` after `retries` consecutive
/// failures and `Cancelled` as soon as the shutdown signal fires.
pub async fn wait_until_healthy<F>(
    executor: &dyn ProbeExecutor,
    service: &str,
    healthcheck: &HealthCheck,
    shutdown: &mut broadcast::Receiver<()>,
    observe: F,
) -> HealthVerdict
where
    F: FnMut(&ProbeAttempt) + Send,
{
    tokio::select! {
        _ = tokio::time::sleep(healthcheck.start_period) => {}
        _ = shutdown.recv() => return HealthVerdict::Cancelled,
    }

    probe_loop(executor, service, healthcheck, shutdown, observe, true).await
}

/// Keeps probing a healthy service until it turns unhealthy or shutdown
/// fires. Never returns `Healthy`.
pub async fn monitor<F>(
    executor: &dyn ProbeExecutor,
    service: &str,
    healthcheck: &HealthCheck,
    shutdown: &mut broadcast::Receiver<()>,
    observe: F,
) -> HealthVerdict
where
    F: FnMut(&ProbeAttempt) + Send,
{
    tokio::select! {
        _ = tokio::time::sleep(healthcheck.interval) => {}
        _ = shutdown.recv() => return HealthVerdict::Cancelled,
    }

    probe_loop(executor, service, healthcheck, shutdown, observe, false).await
}

async fn probe_loop<F>(
    executor: &dyn ProbeExecutor,
    service: &str,
    healthcheck: &HealthCheck,
    shutdown: &mut broadcast::Receiver<()>,
    mut observe: F,
    stop_when_healthy: bool,
) -> HealthVerdict
where
    F: FnMut(&ProbeAttempt) + Send,
{
    let metrics = MetricsCollector::new();
    let retries = healthcheck.retries.max(1);
    let mut attempt = 0u32;
    let mut consecutive = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();

        let result = tokio::select! {
            result = executor.execute(service, &healthcheck.test, healthcheck.timeout) => result,
            _ = shutdown.recv() => return HealthVerdict::Cancelled,
        };

        let (success, reason) = match result {
            Ok(outcome) => (outcome.is_success(), outcome.reason()),
            Err(e) => (false, e.to_string()),
        };
        metrics.record_probe(service, success, started.elapsed());

        if success {
            consecutive = 0;
        } else {
            consecutive += 1;
            tracing::debug!(
                service = %service,
                attempt = attempt,
                consecutive = consecutive,
                reason = %reason,
                "Probe failed"
            );
        }

        observe(&ProbeAttempt {
            attempt,
            consecutive_failures: consecutive,
            success,
            reason: reason.clone(),
        });

        if success && stop_when_healthy {
            return HealthVerdict::Healthy { attempts: attempt };
        }
        if consecutive >= retries {
            return HealthVerdict::Unhealthy {
                attempts: attempt,
                last_reason: reason,
            };
        }

        tokio::select! {
            _ = tokio::time::sleep(healthcheck.interval) => {}
            _ = shutdown.recv() => return HealthVerdict::Cancelled,
        }
    }
}

fn forced_success_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\s*(\|\||;)\s*(exit\s+0|true|:)\s*$").expect("forced success pattern is valid")
    })
}

/// Shell script run by a probe, if it goes through a shell.
fn shell_script(test: &ProbeTest) -> Option<&str> {
    match test {
        ProbeTest::Shell(cmd) => Some(cmd.as_str()),
        ProbeTest::Exec(args) => match args.as_slice() {
            [shell, flag, script, ..]
                if flag == "-c"
                    && matches!(
                        shell.rsplit('/').next(),
                        Some("sh" | "bash" | "dash" | "ash" | "zsh")
                    ) =>
            {
                Some(script.as_str())
            }
            _ => None,
        },
        ProbeTest::None => None,
    }
}

/// Returns true if the probe ends in a fallback such as `|| exit 0` or
/// `|| true`, which makes it succeed whether or not the service is up.
pub fn has_forced_success(test: &ProbeTest) -> bool {
    shell_script(test)
        .map(|script| forced_success_pattern().is_match(script))
        .unwrap_or(false)
}

/// Removes a trailing forced-success fallback so the real exit status
/// propagates. Probes without one are returned unchanged.
pub fn strip_forced_success(test: &ProbeTest) -> ProbeTest {
    let strip = |script: &str| {
        let mut current = script.to_string();
        while forced_success_pattern().is_match(&current) {
            current = forced_success_pattern().replace(&current, "").into_owned();
        }
        current
    };

    match test {
        ProbeTest::Shell(cmd) => ProbeTest::Shell(strip(cmd)),
        ProbeTest::Exec(args) if shell_script(test).is_some() => {
            let mut args = args.clone();
            args[2] = strip(&args[2]);
            ProbeTest::Exec(args)
        }
        other => other.clone(),
    }
}
