//! One-shot provisioning jobs.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::DeploymentConfig;
use crate::error::AirflowError;

use super::cli::{AirflowCli, CommandRunner, UserProvision};
use super::client::{AirflowClient, DagRun};

/// What happened to one provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Executed,
    Skipped,
    AlreadyDone,
}

impl From<UserProvision> for StepStatus {
    fn from(provision: UserProvision) -> Self {
        match provision {
            UserProvision::Created => StepStatus::Executed,
            UserProvision::AlreadyExists => StepStatus::AlreadyDone,
        }
    }
}

/// Result of the init job.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub version: String,
    pub steps: Vec<(String, StepStatus)>,
}

impl InitReport {
    pub fn step(&self, name: &str) -> Option<StepStatus> {
        self.steps.iter().find(|(n, _)| n == name).map(|(_, s)| *s)
    }
}

/// Prepares the metadata store.
///
/// Runs `airflow version`, then the migration when `_AIRFLOW_DB_UPGRADE` is
/// set, then ensures the admin user when `_AIRFLOW_WWW_USER_CREATE` is set.
pub struct InitJob<R: CommandRunner> {
    cli: AirflowCli<R>,
    config: DeploymentConfig,
}

impl<R: CommandRunner> InitJob<R> {
    pub fn new(cli: AirflowCli<R>, config: DeploymentConfig) -> Self {
        Self { cli, config }
    }

    pub async fn run(&self) -> Result<InitReport, AirflowError> {
        let version = self.cli.version().await?;
        info!(version = %version, "Platform available");

        let mut steps = Vec::new();

        if self.config.db_upgrade {
            self.cli.db_migrate().await?;
            steps.push(("db_migrate".to_string(), StepStatus::Executed));
        } else {
            info!("Metadata migration disabled, skipping");
            steps.push(("db_migrate".to_string(), StepStatus::Skipped));
        }

        let user_step = match (self.config.www_user_create, self.config.admin.as_ref()) {
            (true, Some(admin)) => self.cli.ensure_user(admin).await?.into(),
            (true, None) => {
                warn!("User creation enabled but no admin credentials configured");
                StepStatus::Skipped
            }
            (false, _) => StepStatus::Skipped,
        };
        steps.push(("create_user".to_string(), user_step));

        Ok(InitReport { version, steps })
    }
}

/// Result of the trigger job.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub user: StepStatus,
    pub dag_id: String,
    /// False when the DAG was already unpaused.
    pub unpaused: bool,
    pub dag_run_id: String,
}

/// Provisions the admin user, waits for the self-check DAG, unpauses and
/// triggers it.
pub struct TriggerJob<R: CommandRunner> {
    cli: AirflowCli<R>,
    client: AirflowClient,
    config: DeploymentConfig,
}

impl<R: CommandRunner> TriggerJob<R> {
    pub fn new(cli: AirflowCli<R>, client: AirflowClient, config: DeploymentConfig) -> Self {
        Self { cli, client, config }
    }

    /// Fails before any call when the API credentials are not configured.
    pub async fn run(&self) -> Result<TriggerReport, AirflowError> {
        self.config.api_credentials()?;

        let user = match self.config.admin {
            Some(ref admin) => self.cli.ensure_user(admin).await?.into(),
            None => StepStatus::Skipped,
        };

        let dag_id = &self.config.health_check_dag;
        self.client
            .wait_for_dag(
                dag_id,
                self.config.registration_attempts,
                self.config.registration_interval,
            )
            .await?;

        let unpaused = self.client.set_paused(dag_id, false).await?;
        let run: DagRun = self.client.trigger_dag(dag_id, None).await?;

        Ok(TriggerReport {
            user,
            dag_id: dag_id.clone(),
            unpaused,
            dag_run_id: run.dag_run_id,
        })
    }
}
