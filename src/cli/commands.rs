//! CLI command definitions for flightdeck.

use crate::airflow::{AirflowCli, AirflowClient, InitJob, ShellRunner, TriggerJob};
use crate::compose::{has_errors, lint, reference_deployment, Deployment, Severity};
use crate::config::{load_env_file, DeploymentConfig};
use crate::etl::{AviationStackClient, EtlPipeline, FileSource, FlightSink, FlightSource, LogSink, PostgresSink};
use crate::metrics::{export_metrics, init_metrics};
use crate::probe::{strip_forced_success, wait_until_healthy, HealthVerdict, LocalProbeExecutor, ProbeExecutor};
use crate::runtime::{DockerRuntime, ProcessRuntime, RuntimeProbe, ServiceRuntime};
use crate::selfcheck::SelfCheck;
use crate::sequencer::{Sequencer, SequencerConfig};
use crate::storage::{bootstrap_pipeline_database, bootstrap_sql, Database};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Env file read when `--env-file` is not given and it exists.
const DEFAULT_ENV_FILE: &str = ".env";

/// Deployment harness for the flight data platform.
#[derive(Parser)]
#[command(name = "flightdeck")]
#[command(about = "Bring up and provision the flight data platform")]
#[command(version)]
#[command(
    long_about = "flightdeck brings a multi-service deployment up in dependency order, runs the one-shot provisioning jobs and the flight ETL pipeline.\n\nExample usage:\n  flightdeck lint -f docker-compose.yaml\n  flightdeck up --runtime docker --max-job-attempts 5"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Env file with the deployment variables.
    #[arg(long, global = true, env = "FLIGHTDECK_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print the deployment manifest as YAML.
    Render(RenderArgs),

    /// Report manifest defects.
    Lint(LintArgs),

    /// Start every service in dependency order and supervise them.
    Up(UpArgs),

    /// Run a service's health probe.
    Probe(ProbeArgs),

    /// Create the pipeline database and seed table.
    #[command(name = "bootstrap-db")]
    BootstrapDb(BootstrapDbArgs),

    /// Prepare the orchestration metadata store.
    Init(JobArgs),

    /// Provision the admin account and trigger the health check DAG.
    Trigger(JobArgs),

    /// Check the environment, then trigger the ETL DAG.
    #[command(name = "self-check")]
    SelfCheck(SelfCheckArgs),

    /// Run the flight ETL pipeline.
    Etl(EtlArgs),

    /// Validate the environment contract.
    Validate(ValidateArgs),
}

/// Runtime used to run services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
    Docker,
    Process,
}

#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Manifest to render instead of the reference deployment.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Remove forced-success fallbacks from health probes.
    #[arg(long)]
    pub strip_forced_success: bool,

    /// Write to this file instead of stdout.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct LintArgs {
    /// Manifest to lint instead of the reference deployment.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Output findings as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct UpArgs {
    /// Manifest to bring up instead of the reference deployment.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Runtime used to run services.
    #[arg(long, value_enum, default_value = "docker")]
    pub runtime: RuntimeKind,

    /// Upper bound on attempts for one-shot jobs.
    #[arg(long, env = "FLIGHTDECK_MAX_JOB_ATTEMPTS")]
    pub max_job_attempts: Option<u32>,

    /// Seconds allowed for stopping every service on shutdown.
    #[arg(long, default_value = "120")]
    pub shutdown_timeout: u64,

    /// Write Prometheus metrics to this file once startup settles.
    #[arg(long)]
    pub metrics: Option<PathBuf>,

    /// Stop after startup settles instead of supervising.
    #[arg(long)]
    pub no_supervise: bool,

    /// Output the deployment report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Service whose probe to run.
    pub service: String,

    /// Manifest to read instead of the reference deployment.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Runtime the service runs in.
    #[arg(long, value_enum, default_value = "process")]
    pub runtime: RuntimeKind,

    /// Remove a forced-success fallback before probing.
    #[arg(long)]
    pub strip_forced_success: bool,

    /// Apply the probe's start period, interval and retries instead of
    /// probing once.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Parser, Debug)]
pub struct BootstrapDbArgs {
    /// Print an init script for the database container instead of
    /// connecting.
    #[arg(long)]
    pub print_sql: bool,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Platform CLI executable.
    #[arg(long, default_value = "airflow", env = "AIRFLOW_BIN")]
    pub airflow_bin: String,

    /// Seconds allowed for each platform CLI call.
    #[arg(long, default_value = "600")]
    pub command_timeout: u64,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct SelfCheckArgs {
    /// Attempts for triggering the ETL DAG.
    #[arg(long, default_value = "3")]
    pub trigger_attempts: u32,

    /// Seconds between trigger attempts.
    #[arg(long, default_value = "30")]
    pub trigger_interval: u64,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct EtlArgs {
    /// Make failed data quality checks fatal.
    #[arg(long)]
    pub strict: bool,

    /// Read flights from a JSON file instead of the API.
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Log the records instead of loading them.
    #[arg(long)]
    pub dry_run: bool,

    /// Flights requested from the API.
    #[arg(long, default_value = "100")]
    pub limit: u32,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Output the configuration summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let env_file = cli.env_file;
    match cli.command {
        Commands::Render(args) => run_render_command(args, env_file.as_deref()),
        Commands::Lint(args) => run_lint_command(args, env_file.as_deref()),
        Commands::Up(args) => run_up_command(args, env_file.as_deref()).await,
        Commands::Probe(args) => run_probe_command(args, env_file.as_deref()).await,
        Commands::BootstrapDb(args) => run_bootstrap_command(args, env_file.as_deref()).await,
        Commands::Init(args) => run_init_command(args, env_file.as_deref()).await,
        Commands::Trigger(args) => run_trigger_command(args, env_file.as_deref()).await,
        Commands::SelfCheck(args) => run_self_check_command(args, env_file.as_deref()).await,
        Commands::Etl(args) => run_etl_command(args, env_file.as_deref()).await,
        Commands::Validate(args) => run_validate_command(args, env_file.as_deref()),
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn resolve_env_file(env_file: Option<&Path>) -> Option<PathBuf> {
    match env_file {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_ENV_FILE);
            default.exists().then_some(default)
        }
    }
}

fn load_config(env_file: Option<&Path>) -> anyhow::Result<DeploymentConfig> {
    let config = match resolve_env_file(env_file) {
        Some(path) => DeploymentConfig::from_env_file(&path)?,
        None => DeploymentConfig::from_env()?,
    };
    Ok(config)
}

/// Interpolation variables: the env file overlaid by the process environment.
fn interpolation_vars(env_file: Option<&Path>) -> anyhow::Result<BTreeMap<String, String>> {
    let mut vars = match resolve_env_file(env_file) {
        Some(path) => load_env_file(&path)?,
        None => BTreeMap::new(),
    };
    vars.extend(std::env::vars());
    Ok(vars)
}

/// Loads the manifest ready to run: every `${VAR}` resolved, `$$` unescaped.
///
/// Without `--file` the reference deployment is rendered and reparsed so it
/// goes through the same interpolation as a manifest on disk.
fn load_deployment(file: Option<&Path>, env_file: Option<&Path>) -> anyhow::Result<Deployment> {
    let vars = interpolation_vars(env_file)?;
    match file {
        Some(path) => Ok(Deployment::load(path, &vars)?),
        None => {
            let template = reference_deployment(&load_config(env_file)?);
            Ok(Deployment::from_yaml(&template.to_yaml()?, &vars)?)
        }
    }
}

/// Like `load_deployment`, but the reference deployment keeps its
/// placeholders so the rendered file can be handed to compose.
fn load_template(file: Option<&Path>, env_file: Option<&Path>) -> anyhow::Result<Deployment> {
    match file {
        Some(_) => load_deployment(file, env_file),
        None => Ok(reference_deployment(&load_config(env_file)?)),
    }
}

fn manifest_dir(file: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = file
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);
    match dir {
        Some(dir) => Ok(dir),
        None => Ok(std::env::current_dir()?),
    }
}

fn build_runtime(
    kind: RuntimeKind,
    deployment: &Deployment,
    file: Option<&Path>,
) -> anyhow::Result<Arc<dyn ServiceRuntime>> {
    let base_dir = manifest_dir(file)?;
    Ok(match kind {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(deployment.project(), base_dir)?),
        RuntimeKind::Process => Arc::new(ProcessRuntime::new().with_base_dir(base_dir)),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json);
    Ok(())
}

// ============================================================================
// Manifest commands
// ============================================================================

fn run_render_command(args: RenderArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let mut deployment = load_template(args.file.as_deref(), env_file)?;

    if args.strip_forced_success {
        for (name, spec) in deployment.services.iter_mut() {
            if let Some(ref mut hc) = spec.healthcheck {
                let stripped = strip_forced_success(&hc.test);
                if stripped != hc.test {
                    info!(service = %name, "Removed forced-success fallback");
                    hc.test = stripped;
                }
            }
        }
    }

    let yaml = deployment.to_yaml()?;
    match args.output {
        Some(path) => {
            fs::write(&path, yaml)?;
            info!(path = %path.display(), "Manifest written");
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn run_lint_command(args: LintArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let deployment = load_deployment(args.file.as_deref(), env_file)?;
    let findings = lint(&deployment);

    if args.json {
        print_json(&findings)?;
    } else if findings.is_empty() {
        println!("No findings");
    } else {
        for finding in &findings {
            println!("{}", finding);
        }
    }

    if has_errors(&findings) {
        let errors = findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count();
        return Err(anyhow::anyhow!("{} lint error(s)", errors));
    }
    Ok(())
}

// ============================================================================
// Sequencer commands
// ============================================================================

async fn run_up_command(args: UpArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    if args.metrics.is_some() {
        init_metrics()?;
    }

    let deployment = load_deployment(args.file.as_deref(), env_file)?;
    for finding in lint(&deployment) {
        match finding.severity {
            Severity::Error => warn!(service = %finding.service, "{}", finding.message),
            _ => info!(service = %finding.service, "{}", finding.message),
        }
    }

    let runtime = build_runtime(args.runtime, &deployment, args.file.as_deref())?;
    let mut config =
        SequencerConfig::default().with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout));
    if let Some(attempts) = args.max_job_attempts {
        config = config.with_max_job_attempts(attempts);
    }

    let sequencer = Sequencer::new(deployment, runtime, config)?;
    info!(
        runtime = ?args.runtime,
        layers = sequencer.graph().start_order().len(),
        "Bringing deployment up"
    );

    let report = tokio::select! {
        report = sequencer.run() => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during startup, shutting down");
            sequencer.shutdown().await?;
            return Err(anyhow::anyhow!("Startup interrupted"));
        }
    };

    if let Some(ref path) = args.metrics {
        fs::write(path, export_metrics())?;
    }

    if args.json {
        print_json(&report)?;
    } else {
        print!("{}", report.summary());
    }

    if !report.succeeded() {
        sequencer.shutdown().await?;
        let failed: Vec<&str> = report.failures().iter().map(|o| o.name.as_str()).collect();
        return Err(anyhow::anyhow!("Deployment failed: {}", failed.join(", ")));
    }

    if !args.no_supervise {
        info!("Deployment is up, supervising (Ctrl-C to stop)");
        tokio::select! {
            _ = sequencer.supervise() => {}
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        }
    }

    sequencer.shutdown().await?;
    if let Some(ref path) = args.metrics {
        fs::write(path, export_metrics())?;
    }
    Ok(())
}

async fn run_probe_command(args: ProbeArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let deployment = load_deployment(args.file.as_deref(), env_file)?;
    let spec = deployment
        .service(&args.service)
        .ok_or_else(|| anyhow::anyhow!("Unknown service '{}'", args.service))?;
    let mut healthcheck = spec
        .probe()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Service '{}' has no health check", args.service))?;

    if args.strip_forced_success {
        healthcheck.test = strip_forced_success(&healthcheck.test);
    }

    let executor: Box<dyn ProbeExecutor> = match args.runtime {
        RuntimeKind::Process => Box::new(LocalProbeExecutor::new()),
        RuntimeKind::Docker => Box::new(RuntimeProbe::new(build_runtime(
            args.runtime,
            &deployment,
            args.file.as_deref(),
        )?)),
    };

    if args.wait {
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let verdict = wait_until_healthy(
            executor.as_ref(),
            &args.service,
            &healthcheck,
            &mut shutdown_rx,
            |attempt| {
                info!(
                    service = %args.service,
                    attempt = attempt.attempt,
                    success = attempt.success,
                    reason = %attempt.reason,
                    "Probe attempt"
                )
            },
        )
        .await;
        return match verdict {
            HealthVerdict::Healthy { attempts } => {
                println!("{} healthy after {} attempt(s)", args.service, attempts);
                Ok(())
            }
            HealthVerdict::Unhealthy { attempts, last_reason } => Err(anyhow::anyhow!(
                "{} unhealthy after {} attempt(s): {}",
                args.service,
                attempts,
                last_reason
            )),
            HealthVerdict::Cancelled => Err(anyhow::anyhow!("Probe cancelled")),
        };
    }

    let outcome = executor
        .execute(&args.service, &healthcheck.test, healthcheck.timeout)
        .await?;
    println!("{}: {}", args.service, outcome.reason());
    if !outcome.is_success() {
        return Err(anyhow::anyhow!("Probe for '{}' failed", args.service));
    }
    Ok(())
}

// ============================================================================
// Provisioning commands
// ============================================================================

async fn run_bootstrap_command(args: BootstrapDbArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(env_file)?;

    if args.print_sql {
        print!("{}", bootstrap_sql(&config.pipeline_db)?);
        return Ok(());
    }

    let report = bootstrap_pipeline_database(&config).await?;
    if args.json {
        print_json(&report)?;
    } else {
        println!(
            "database {}: created={} table_created={} rows_inserted={} rows={}",
            config.pipeline_db,
            report.database_created,
            report.table_created,
            report.rows_inserted,
            report.row_count
        );
    }
    Ok(())
}

fn airflow_cli(args: &JobArgs) -> AirflowCli<ShellRunner> {
    AirflowCli::new(ShellRunner::new(Duration::from_secs(args.command_timeout)))
        .with_program(&args.airflow_bin)
}

async fn run_init_command(args: JobArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(env_file)?;
    let report = InitJob::new(airflow_cli(&args), config).run().await?;

    if args.json {
        print_json(&report)?;
    } else {
        println!("platform version {}", report.version);
        for (step, status) in &report.steps {
            println!("  {:<14} {:?}", step, status);
        }
    }
    Ok(())
}

async fn run_trigger_command(args: JobArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(env_file)?;
    let client = AirflowClient::from_config(&config)?;
    let report = TriggerJob::new(airflow_cli(&args), client, config).run().await?;

    if args.json {
        print_json(&report)?;
    } else {
        println!(
            "user {:?}, dag {} unpaused={}, run {}",
            report.user, report.dag_id, report.unpaused, report.dag_run_id
        );
    }
    Ok(())
}

async fn run_self_check_command(args: SelfCheckArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(env_file)?;
    let client = AirflowClient::from_config(&config)?;
    let report = SelfCheck::standard(&config, client)
        .with_trigger_retries(args.trigger_attempts, Duration::from_secs(args.trigger_interval))
        .run()
        .await;

    if args.json {
        print_json(&report)?;
    } else {
        for check in &report.checks {
            let status = match (check.passed, check.required) {
                (true, _) => "ok",
                (false, true) => "FAILED",
                (false, false) => "warn",
            };
            println!("{:<20} {:<6} {}", check.name, status, check.detail);
        }
        match report.triggered {
            Some(ref run_id) => println!("triggered {} ({})", report.etl_dag, run_id),
            None => println!("{} not triggered", report.etl_dag),
        }
    }

    if !report.required_passed() {
        return Err(anyhow::anyhow!("Required checks failed"));
    }
    if let Some(error) = report.trigger_error {
        return Err(anyhow::anyhow!("Failed to trigger {}: {}", report.etl_dag, error));
    }
    Ok(())
}

// ============================================================================
// Pipeline commands
// ============================================================================

async fn run_etl_command(args: EtlArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(env_file)?;

    let source: Box<dyn FlightSource> = match args.input {
        Some(ref path) => Box::new(FileSource::new(path)),
        None => {
            let key = config.aviationstack_api_key.clone().unwrap_or_default();
            Box::new(
                AviationStackClient::new(&config.aviationstack_url, key)?.with_limit(args.limit),
            )
        }
    };

    let sink: Box<dyn FlightSink> = if args.dry_run {
        Box::new(LogSink)
    } else {
        let db = Database::connect(&config.pipeline_database_url()).await?;
        db.run_migrations().await?;
        Box::new(PostgresSink::new(db))
    };

    let report = EtlPipeline::new(source, sink)
        .with_quality_dir(config.quality_dir())
        .strict(args.strict)
        .run()
        .await?;

    if args.json {
        print_json(&report)?;
    } else {
        println!(
            "extracted {} transformed {} dropped {} loaded {}",
            report.extracted, report.transformed, report.dropped, report.loaded
        );
        for failed in report.validation.failed() {
            println!(
                "  failed {} on {} ({} unexpected)",
                failed.expectation.kind(),
                failed.expectation.column(),
                failed.unexpected_count
            );
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    postgres: String,
    pipeline_db: String,
    db_upgrade: bool,
    www_user_create: bool,
    admin_user: Option<String>,
    airflow_api_url: String,
    health_check_dag: String,
    etl_dag: String,
    airflow_home: String,
    aviationstack_api_key: bool,
}

fn run_validate_command(args: ValidateArgs, env_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(env_file)?;
    let summary = ConfigSummary {
        postgres: format!(
            "{}@{}:{}/{}",
            config.postgres_user, config.postgres_host, config.postgres_port, config.postgres_db
        ),
        pipeline_db: config.pipeline_db.clone(),
        db_upgrade: config.db_upgrade,
        www_user_create: config.www_user_create,
        admin_user: config.admin.as_ref().map(|a| a.username.clone()),
        airflow_api_url: config.airflow_api_url.clone(),
        health_check_dag: config.health_check_dag.clone(),
        etl_dag: config.etl_dag.clone(),
        airflow_home: config.airflow_home.display().to_string(),
        aviationstack_api_key: config.aviationstack_api_key.is_some(),
    };

    if args.json {
        print_json(&summary)?;
    } else {
        println!("Configuration is valid");
        println!("  postgres          {}", summary.postgres);
        println!("  pipeline db       {}", summary.pipeline_db);
        println!("  db upgrade        {}", summary.db_upgrade);
        println!("  create admin      {}", summary.www_user_create);
        println!("  api               {}", summary.airflow_api_url);
        println!("  dags              {}, {}", summary.health_check_dag, summary.etl_dag);
        if !summary.aviationstack_api_key {
            warn!("AVIATIONSTACK_API_KEY is not set; `etl` needs it unless --input is given");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_up() {
        let cli = Cli::try_parse_from([
            "flightdeck",
            "up",
            "--runtime",
            "process",
            "--max-job-attempts",
            "5",
            "-f",
            "compose.yaml",
        ])
        .unwrap();
        match cli.command {
            Commands::Up(args) => {
                assert_eq!(args.runtime, RuntimeKind::Process);
                assert_eq!(args.max_job_attempts, Some(5));
                assert_eq!(args.file, Some(PathBuf::from("compose.yaml")));
                assert!(!args.no_supervise);
            }
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "flightdeck",
            "etl",
            "--strict",
            "--dry-run",
            "--env-file",
            "prod.env",
            "-l",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.env_file, Some(PathBuf::from("prod.env")));
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Etl(args) => {
                assert!(args.strict);
                assert!(args.dry_run);
                assert_eq!(args.limit, 100);
            }
            _ => panic!("expected etl"),
        }
    }

    #[test]
    fn test_hyphenated_subcommands() {
        assert!(matches!(
            Cli::try_parse_from(["flightdeck", "bootstrap-db", "--print-sql"])
                .unwrap()
                .command,
            Commands::BootstrapDb(BootstrapDbArgs { print_sql: true, .. })
        ));
        assert!(matches!(
            Cli::try_parse_from(["flightdeck", "self-check"]).unwrap().command,
            Commands::SelfCheck(_)
        ));
    }

    #[test]
    fn test_interpolation_vars_overlay_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("test.env");
        fs::write(&env, "FLIGHTDECK_TEST_ONLY_IN_FILE=file\nPATH=from-file\n").unwrap();

        let vars = interpolation_vars(Some(&env)).unwrap();
        assert_eq!(vars.get("FLIGHTDECK_TEST_ONLY_IN_FILE").map(String::as_str), Some("file"));
        assert_ne!(vars.get("PATH").map(String::as_str), Some("from-file"));
    }

    fn reference_env(dir: &Path) -> PathBuf {
        let env = dir.join("test.env");
        fs::write(
            &env,
            "POSTGRES_USER=flightops\nPOSTGRES_PASSWORD=secret\nPOSTGRES_DB=airflow\n\
             _AIRFLOW_DB_UPGRADE=true\n_AIRFLOW_WWW_USER_CREATE=true\n\
             _AIRFLOW_WWW_USER_USERNAME=admin\n_AIRFLOW_WWW_USER_PASSWORD=admin\n",
        )
        .unwrap();
        env
    }

    #[test]
    fn test_reference_deployment_is_interpolated() {
        let dir = tempfile::tempdir().unwrap();
        let env = reference_env(dir.path());

        let deployment = load_deployment(None, Some(&env)).unwrap();
        let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "flightops".to_string());

        let webserver = deployment.service("airflow-webserver").unwrap();
        if std::env::var("AIRFLOW_IMAGE").is_err() {
            assert_eq!(webserver.image.as_deref(), Some("apache/airflow:2.8.1"));
        }
        let postgres = deployment.service("postgres").unwrap();
        assert_eq!(postgres.environment.get("POSTGRES_USER"), Some(&user));
        assert_eq!(
            postgres.probe().unwrap().test.argv(),
            vec!["pg_isready".to_string(), "-U".to_string(), user]
        );

        // Only the scheduler's shell variable survives, unescaped for the shell.
        let yaml = deployment.to_yaml().unwrap();
        assert!(!yaml.contains("$$"));
        assert!(!yaml.replace("${HOSTNAME}", "").contains("${"), "{}", yaml);
    }

    #[test]
    fn test_render_keeps_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let env = reference_env(dir.path());

        let yaml = load_template(None, Some(&env)).unwrap().to_yaml().unwrap();
        assert!(yaml.contains("${POSTGRES_USER}"));
        assert!(yaml.contains("$${HOSTNAME}"));
    }

    #[test]
    fn test_manifest_dir() {
        assert_eq!(
            manifest_dir(Some(Path::new("deploy/compose.yaml"))).unwrap(),
            PathBuf::from("deploy")
        );
        assert_eq!(
            manifest_dir(Some(Path::new("compose.yaml"))).unwrap(),
            std::env::current_dir().unwrap()
        );
    }
}
