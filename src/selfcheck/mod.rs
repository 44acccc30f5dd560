//! Health-check workflow.
//!
//! Runs environment checks, then triggers the ETL DAG. Required checks gate
//! the trigger; advisory checks are logged and never block it.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::airflow::{AirflowClient, Connection};
use crate::config::DeploymentConfig;
use crate::error::AirflowError;
use crate::storage::{Database, DatabaseError, SeedBootstrap};

/// Errors reported by individual checks.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Platform error: {0}")]
    Airflow(#[from] AirflowError),

    #[error("Directory {path} is not usable: {message}")]
    Directory { path: String, message: String },

    #[error("Failed to read system information: {0}")]
    System(String),
}

/// One environment check.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    /// Required checks gate the trigger.
    fn required(&self) -> bool;

    /// Runs the check and returns a one-line detail.
    async fn run(&self) -> Result<String, CheckError>;
}

/// Pipeline database reachable, seed table present with its row count.
pub struct PostgresCheck {
    database_url: String,
}

impl PostgresCheck {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl Check for PostgresCheck {
    fn name(&self) -> &str {
        "postgres"
    }

    fn required(&self) -> bool {
        true
    }

    async fn run(&self) -> Result<String, CheckError> {
        let db = Database::connect(&self.database_url).await?;
        if !db.table_exists("testdata").await? {
            warn!("Table 'testdata' missing, bootstrapping it");
            SeedBootstrap::new(&db).run().await?;
        }
        let rows = db.row_count("testdata").await?;
        db.pool().close().await;
        Ok(format!("table 'testdata' exists with {} rows", rows))
    }
}

/// The `postgres_default` connection exists; created without a password
/// when missing.
pub struct ConnectionsCheck {
    client: AirflowClient,
    connection: Connection,
}

impl ConnectionsCheck {
    pub fn new(client: AirflowClient, connection: Connection) -> Self {
        Self { client, connection }
    }
}

#[async_trait]
impl Check for ConnectionsCheck {
    fn name(&self) -> &str {
        "airflow-connections"
    }

    fn required(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<String, CheckError> {
        let created = self.client.ensure_connection(&self.connection).await?;
        Ok(if created {
            format!(
                "connection '{}' created without password",
                self.connection.connection_id
            )
        } else {
            format!("connection '{}' exists", self.connection.connection_id)
        })
    }
}

/// Directories exist and are writable.
pub struct FilesystemCheck {
    dirs: Vec<PathBuf>,
}

impl FilesystemCheck {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

#[async_trait]
impl Check for FilesystemCheck {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn required(&self) -> bool {
        true
    }

    async fn run(&self) -> Result<String, CheckError> {
        for dir in &self.dirs {
            check_writable(dir).await?;
        }
        Ok(format!("{} directories writable", self.dirs.len()))
    }
}

async fn check_writable(dir: &Path) -> Result<(), CheckError> {
    let fail = |message: String| CheckError::Directory {
        path: dir.display().to_string(),
        message,
    };

    let meta = tokio::fs::metadata(dir)
        .await
        .map_err(|_| fail("does not exist".to_string()))?;
    if !meta.is_dir() {
        return Err(fail("not a directory".to_string()));
    }

    let probe = dir.join(".test_write");
    tokio::fs::write(&probe, b"test")
        .await
        .map_err(|e| fail(e.to_string()))?;
    tokio::fs::remove_file(&probe)
        .await
        .map_err(|e| fail(e.to_string()))?;
    Ok(())
}

/// Load average and memory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub load: [f64; 3],
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
}

impl SystemSnapshot {
    /// Reads `loadavg` and `meminfo` below `proc_root`.
    pub fn read(proc_root: &Path) -> Result<Self, CheckError> {
        let loadavg = std::fs::read_to_string(proc_root.join("loadavg"))
            .map_err(|e| CheckError::System(format!("loadavg: {}", e)))?;
        let meminfo = std::fs::read_to_string(proc_root.join("meminfo"))
            .map_err(|e| CheckError::System(format!("meminfo: {}", e)))?;
        Self::parse(&loadavg, &meminfo)
    }

    pub fn parse(loadavg: &str, meminfo: &str) -> Result<Self, CheckError> {
        let mut load = [0.0; 3];
        let fields: Vec<&str> = loadavg.split_whitespace().take(3).collect();
        if fields.len() != 3 {
            return Err(CheckError::System(format!("unexpected loadavg '{}'", loadavg.trim())));
        }
        for (slot, field) in load.iter_mut().zip(fields) {
            *slot = field
                .parse()
                .map_err(|_| CheckError::System(format!("invalid load value '{}'", field)))?;
        }

        let mem = |key: &str| -> Option<u64> {
            meminfo
                .lines()
                .find_map(|line| line.strip_prefix(key))
                .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
                .and_then(|v| v.parse().ok())
        };

        Ok(Self {
            load,
            mem_total_kb: mem("MemTotal").unwrap_or(0),
            mem_available_kb: mem("MemAvailable").unwrap_or(0),
        })
    }
}

/// Logs a system snapshot.
pub struct SystemCheck {
    proc_root: PathBuf,
}

impl Default for SystemCheck {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl SystemCheck {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

#[async_trait]
impl Check for SystemCheck {
    fn name(&self) -> &str {
        "system"
    }

    fn required(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<String, CheckError> {
        let snapshot = SystemSnapshot::read(&self.proc_root)?;
        Ok(format!(
            "load {:.2} {:.2} {:.2}, memory {} of {} MiB available",
            snapshot.load[0],
            snapshot.load[1],
            snapshot.load[2],
            snapshot.mem_available_kb / 1024,
            snapshot.mem_total_kb / 1024
        ))
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub required: bool,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of the workflow.
#[derive(Debug, Clone, Serialize)]
pub struct SelfCheckReport {
    pub checks: Vec<CheckOutcome>,
    pub etl_dag: String,
    /// The ETL DAG was paused and this run unpaused it.
    pub unpaused: bool,
    /// Run id of the triggered ETL DAG.
    pub triggered: Option<String>,
    pub trigger_error: Option<String>,
}

impl SelfCheckReport {
    pub fn required_passed(&self) -> bool {
        self.checks.iter().filter(|c| c.required).all(|c| c.passed)
    }

    /// Required checks passed and the ETL DAG was triggered.
    pub fn succeeded(&self) -> bool {
        self.required_passed() && self.triggered.is_some()
    }
}

/// Runs the checks and triggers the ETL DAG.
pub struct SelfCheck {
    checks: Vec<Box<dyn Check>>,
    client: AirflowClient,
    etl_dag: String,
    trigger_attempts: u32,
    trigger_interval: Duration,
}

impl SelfCheck {
    pub fn new(client: AirflowClient, etl_dag: impl Into<String>) -> Self {
        Self {
            checks: Vec::new(),
            client,
            etl_dag: etl_dag.into(),
            trigger_attempts: 3,
            trigger_interval: Duration::from_secs(30),
        }
    }

    /// The four standard checks.
    pub fn standard(config: &DeploymentConfig, client: AirflowClient) -> Self {
        let connection = Connection::postgres_default(config);
        Self::new(client.clone(), &config.etl_dag)
            .with_check(Box::new(PostgresCheck::new(config.pipeline_database_url())))
            .with_check(Box::new(ConnectionsCheck::new(client, connection)))
            .with_check(Box::new(FilesystemCheck::new(config.required_dirs())))
            .with_check(Box::new(SystemCheck::default()))
    }

    /// Builder method to add a check.
    pub fn with_check(mut self, check: Box<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    /// Builder method to set the trigger retry budget.
    pub fn with_trigger_retries(mut self, attempts: u32, interval: Duration) -> Self {
        self.trigger_attempts = attempts.max(1);
        self.trigger_interval = interval;
        self
    }

    /// Runs every check, then triggers the ETL DAG if the required ones
    /// passed.
    pub async fn run(&self) -> SelfCheckReport {
        let mut checks = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let outcome = match check.run().await {
                Ok(detail) => {
                    info!(check = check.name(), detail = %detail, "Check passed");
                    CheckOutcome {
                        name: check.name().to_string(),
                        required: check.required(),
                        passed: true,
                        detail,
                    }
                }
                Err(e) => {
                    if check.required() {
                        error!(check = check.name(), error = %e, "Required check failed");
                    } else {
                        warn!(check = check.name(), error = %e, "Advisory check failed, continuing");
                    }
                    CheckOutcome {
                        name: check.name().to_string(),
                        required: check.required(),
                        passed: false,
                        detail: e.to_string(),
                    }
                }
            };
            checks.push(outcome);
        }

        let mut report = SelfCheckReport {
            checks,
            etl_dag: self.etl_dag.clone(),
            unpaused: false,
            triggered: None,
            trigger_error: None,
        };

        if !report.required_passed() {
            error!(dag_id = %self.etl_dag, "Required checks failed, not triggering");
            return report;
        }

        match self.trigger().await {
            Ok((unpaused, run_id)) => {
                report.unpaused = unpaused;
                report.triggered = Some(run_id);
            }
            Err(e) => report.trigger_error = Some(e.to_string()),
        }
        report
    }

    /// Unpauses and triggers the ETL DAG, retrying both steps together.
    async fn trigger(&self) -> Result<(bool, String), AirflowError> {
        let mut last_error = None;
        for attempt in 1..=self.trigger_attempts {
            match self.activate().await {
                Ok(activated) => return Ok(activated),
                Err(e) => {
                    warn!(
                        dag_id = %self.etl_dag,
                        attempt = attempt,
                        max_attempts = self.trigger_attempts,
                        error = %e,
                        "Trigger failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < self.trigger_attempts {
                tokio::time::sleep(self.trigger_interval).await;
            }
        }
        Err(last_error.unwrap_or_else(|| AirflowError::RequestFailed("no attempts made".to_string())))
    }

    async fn activate(&self) -> Result<(bool, String), AirflowError> {
        let unpaused = self.client.set_paused(&self.etl_dag, false).await?;
        let run = self.client.trigger_dag(&self.etl_dag, None).await?;
        Ok((unpaused, run.dag_run_id))
    }
}
