//! Local process runtime.
//!
//! Runs each service's command as a child process. Output is forwarded to
//! the log with the service name attached. Probes run on the local host.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::compose::{ProbeTest, ServiceSpec};
use crate::config::load_env_file;
use crate::error::RuntimeError;
use crate::probe::{LocalProbeExecutor, ProbeExecutor, ProbeOutcome};

use super::{service_argv, ServiceRuntime};

/// Exit code reported for processes killed by a signal.
const SIGNALLED_EXIT_CODE: i64 = 137;

struct ProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<i64>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Runtime that runs services as local processes.
pub struct ProcessRuntime {
    base_dir: Option<PathBuf>,
    probes: LocalProbeExecutor,
    handles: Mutex<HashMap<String, ProcessHandle>>,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self {
            base_dir: None,
            probes: LocalProbeExecutor::new(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Working directory for processes and base for relative env files.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// PID of a running service, if known.
    pub fn pid(&self, name: &str) -> Option<u32> {
        self.lock().get(name).and_then(|h| h.pid)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessHandle>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn environment(&self, name: &str, spec: &ServiceSpec) -> Result<Vec<(String, String)>, RuntimeError> {
        let mut env = Vec::new();
        for file in &spec.env_file {
            let path = match self.base_dir {
                Some(ref base) => base.join(file),
                None => PathBuf::from(file),
            };
            let vars = load_env_file(&path).map_err(|e| RuntimeError::StartFailed {
                service: name.to_string(),
                reason: e.to_string(),
            })?;
            env.extend(vars);
        }
        env.extend(spec.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(env)
    }
}

fn forward_output<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(service = %service, stream = stream, "{}", line);
        }
    });
}

#[async_trait]
impl ServiceRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&self, name: &str, spec: &ServiceSpec) -> Result<(), RuntimeError> {
        let previous = self.lock().contains_key(name);
        if previous {
            self.stop(name, Duration::from_secs(10)).await?;
        }

        let argv = service_argv(name, spec)?;
        let env = self.environment(name, spec)?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.base_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| RuntimeError::StartFailed {
            service: name.to_string(),
            reason: format!("{}: {}", argv[0], e),
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.to_string(), "stderr", stderr);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let service = name.to_string();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code().map(i64::from).unwrap_or(SIGNALLED_EXIT_CODE),
                Err(_) => -1,
            };
            debug!(service = %service, exit_code = code, "Process exited");
            let _ = exit_tx.send(Some(code));
        });

        debug!(service = %name, pid = ?pid, command = %argv.join(" "), "Process started");
        self.lock().insert(
            name.to_string(),
            ProcessHandle {
                pid,
                exit_rx,
                kill_tx: Some(kill_tx),
            },
        );

        Ok(())
    }

    async fn wait_exit(&self, name: &str) -> Result<i64, RuntimeError> {
        let mut rx = self
            .lock()
            .get(name)
            .map(|h| h.exit_rx.clone())
            .ok_or_else(|| RuntimeError::NotStarted(name.to_string()))?;

        let code = rx
            .wait_for(Option::is_some)
            .await
            .map(|code| code.unwrap_or(-1))
            .unwrap_or(-1);
        Ok(code)
    }

    async fn probe(
        &self,
        name: &str,
        test: &ProbeTest,
        timeout: Duration,
    ) -> Result<ProbeOutcome, RuntimeError> {
        self.probes
            .execute(name, test, timeout)
            .await
            .map_err(|e| RuntimeError::ProbeFailed {
                service: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let handle = self.lock().remove(name);
        let Some(mut handle) = handle else {
            return Ok(());
        };

        if let Some(kill) = handle.kill_tx.take() {
            let _ = kill.send(());
        }

        let mut rx = handle.exit_rx;
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map(|_| ());
        match waited {
            Ok(_) => Ok(()),
            Err(_) => Err(RuntimeError::StopFailed {
                service: name.to_string(),
                reason: format!("still running after {:?}", timeout),
            }),
        }
    }
}
