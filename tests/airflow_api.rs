//! Integration tests for the provisioning jobs and the self-check workflow
//! against a scripted platform CLI and a mocked REST API.

use async_trait::async_trait;
use flightdeck::airflow::{
    AirflowCli, AirflowClient, CommandOutput, CommandRunner, Connection, InitJob, StepStatus,
    TriggerJob,
};
use flightdeck::config::DeploymentConfig;
use flightdeck::error::CommandError;
use flightdeck::selfcheck::{ConnectionsCheck, FilesystemCheck, SelfCheck};
use mockito::{Matcher, Server};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Platform CLI that keeps users in memory and logs every subcommand.
#[derive(Default)]
struct FakePlatform {
    users: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakePlatform {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn users(&self) -> Vec<String> {
        self.users.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakePlatform {
    async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let sub: Vec<&str> = args.iter().take(2).map(String::as_str).collect();
        self.calls.lock().unwrap().push(sub.join(" "));

        match sub.as_slice() {
            ["version"] => Ok(CommandOutput::success("2.8.1\n")),
            ["db", "migrate"] => Ok(CommandOutput::success("Database migrating done!\n")),
            ["users", "list"] => {
                let listed: Vec<String> = self
                    .users()
                    .iter()
                    .map(|u| format!(r#"{{"id": 1, "username": "{}"}}"#, u))
                    .collect();
                Ok(CommandOutput::success(format!("[{}]", listed.join(", "))))
            }
            ["users", "create"] => {
                let username = args
                    .windows(2)
                    .find(|w| w[0] == "--username")
                    .map(|w| w[1].clone())
                    .unwrap_or_default();
                let mut users = self.users.lock().unwrap();
                if users.contains(&username) {
                    return Ok(CommandOutput::failure(1, format!("{} already exist in the db", username)));
                }
                users.push(username);
                Ok(CommandOutput::success("User created\n"))
            }
            _ => Ok(CommandOutput::failure(2, "unknown command")),
        }
    }
}

fn config(api_url: &str, db_upgrade: bool) -> DeploymentConfig {
    let mut env = BTreeMap::new();
    env.insert("POSTGRES_USER", "airflow".to_string());
    env.insert("POSTGRES_PASSWORD", "airflow".to_string());
    env.insert("POSTGRES_DB", "airflow".to_string());
    env.insert("_AIRFLOW_DB_UPGRADE", db_upgrade.to_string());
    env.insert("_AIRFLOW_WWW_USER_CREATE", "true".to_string());
    env.insert("_AIRFLOW_WWW_USER_USERNAME", "admin".to_string());
    env.insert("_AIRFLOW_WWW_USER_PASSWORD", "admin".to_string());
    env.insert("AIRFLOW_API_URL", api_url.to_string());
    env.insert("DAG_REGISTRATION_ATTEMPTS", "3".to_string());
    env.insert("DAG_REGISTRATION_INTERVAL_SECS", "0".to_string());
    DeploymentConfig::from_lookup(|key| env.get(key).cloned()).expect("config should load")
}

#[tokio::test]
async fn test_init_twice_is_idempotent() {
    let platform = Arc::new(FakePlatform::default());
    let config = config("http://localhost:8080/api/v1", true);

    let first = InitJob::new(AirflowCli::new(Arc::clone(&platform)), config.clone())
        .run()
        .await
        .unwrap();
    let second = InitJob::new(AirflowCli::new(Arc::clone(&platform)), config)
        .run()
        .await
        .unwrap();

    assert_eq!(first.step("db_migrate"), Some(StepStatus::Executed));
    assert_eq!(first.step("create_user"), Some(StepStatus::Executed));
    assert_eq!(second.step("create_user"), Some(StepStatus::AlreadyDone));
    assert_eq!(platform.users(), vec!["admin"]);

    // Migration always precedes user provisioning.
    let calls = platform.calls();
    let migrate = calls.iter().position(|c| c == "db migrate").unwrap();
    let list = calls.iter().position(|c| c == "users list").unwrap();
    assert!(migrate < list);
}

#[tokio::test]
async fn test_init_skips_migration_when_disabled() {
    let platform = Arc::new(FakePlatform::default());
    let config = config("http://localhost:8080/api/v1", false);

    let report = InitJob::new(AirflowCli::new(Arc::clone(&platform)), config)
        .run()
        .await
        .unwrap();

    assert_eq!(report.step("db_migrate"), Some(StepStatus::Skipped));
    assert!(!platform.calls().iter().any(|c| c == "db migrate"));
}

#[tokio::test]
async fn test_trigger_scenario_unpauses_and_runs_health_check() {
    let mut server = Server::new_async().await;
    let api = format!("{}/api/v1", server.url());

    let get_dag = server
        .mock("GET", "/api/v1/dags/health_check_dag")
        .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
        .with_status(200)
        .with_body(r#"{"dag_id": "health_check_dag", "is_paused": true, "is_active": true}"#)
        .expect(2)
        .create_async()
        .await;
    let unpause = server
        .mock("PATCH", "/api/v1/dags/health_check_dag")
        .match_query(Matcher::UrlEncoded("update_mask".into(), "is_paused".into()))
        .match_body(Matcher::Json(serde_json::json!({"is_paused": false})))
        .with_status(200)
        .with_body(r#"{"dag_id": "health_check_dag", "is_paused": false}"#)
        .expect(1)
        .create_async()
        .await;
    let trigger = server
        .mock("POST", "/api/v1/dags/health_check_dag/dagRuns")
        .with_status(200)
        .with_body(r#"{"dag_run_id": "manual__2024-03-01", "dag_id": "health_check_dag", "state": "queued"}"#)
        .expect(1)
        .create_async()
        .await;

    let platform = Arc::new(FakePlatform::default());
    let config = config(&api, true);
    let client = AirflowClient::from_config(&config).unwrap();

    let report = TriggerJob::new(AirflowCli::new(Arc::clone(&platform)), client, config)
        .run()
        .await
        .unwrap();

    assert_eq!(report.user, StepStatus::Executed);
    assert!(report.unpaused);
    assert_eq!(report.dag_run_id, "manual__2024-03-01");
    assert_eq!(platform.users(), vec!["admin"]);

    get_dag.assert_async().await;
    unpause.assert_async().await;
    trigger.assert_async().await;
}

#[tokio::test]
async fn test_self_check_creates_connection_and_activates_etl() {
    let mut server = Server::new_async().await;
    let api = format!("{}/api/v1", server.url());

    let missing = server
        .mock("GET", "/api/v1/connections/postgres_default")
        .with_status(404)
        .with_body(r#"{"title": "Connection not found", "status": 404}"#)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/api/v1/connections")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "connection_id": "postgres_default",
            "conn_type": "postgres"
        })))
        .with_status(200)
        .with_body(r#"{"connection_id": "postgres_default", "conn_type": "postgres"}"#)
        .expect(1)
        .create_async()
        .await;
    let etl_dag = server
        .mock("GET", "/api/v1/dags/pandas_etl_pipeline")
        .with_status(200)
        .with_body(r#"{"dag_id": "pandas_etl_pipeline", "is_paused": true, "is_active": true}"#)
        .create_async()
        .await;
    let unpause = server
        .mock("PATCH", "/api/v1/dags/pandas_etl_pipeline")
        .match_query(Matcher::UrlEncoded("update_mask".into(), "is_paused".into()))
        .with_status(200)
        .with_body(r#"{"dag_id": "pandas_etl_pipeline", "is_paused": false}"#)
        .expect(1)
        .create_async()
        .await;
    let trigger = server
        .mock("POST", "/api/v1/dags/pandas_etl_pipeline/dagRuns")
        .with_status(200)
        .with_body(r#"{"dag_run_id": "manual__etl", "dag_id": "pandas_etl_pipeline"}"#)
        .expect(1)
        .create_async()
        .await;

    let home = tempfile::tempdir().unwrap();
    let config = config(&api, true).with_airflow_home(home.path());
    for dir in config.required_dirs() {
        std::fs::create_dir_all(dir).unwrap();
    }
    let client = AirflowClient::from_config(&config).unwrap();

    let report = SelfCheck::new(client.clone(), &config.etl_dag)
        .with_check(Box::new(ConnectionsCheck::new(
            client,
            Connection::postgres_default(&config),
        )))
        .with_check(Box::new(FilesystemCheck::new(config.required_dirs())))
        .with_trigger_retries(1, Duration::from_millis(1))
        .run()
        .await;

    assert!(report.succeeded(), "{:?}", report);
    assert_eq!(report.triggered.as_deref(), Some("manual__etl"));
    assert!(report.unpaused);

    missing.assert_async().await;
    create.assert_async().await;
    etl_dag.assert_async().await;
    unpause.assert_async().await;
    trigger.assert_async().await;
}

#[tokio::test]
async fn test_self_check_missing_directory_blocks_etl() {
    let mut server = Server::new_async().await;
    let trigger = server
        .mock("POST", "/api/v1/dags/pandas_etl_pipeline/dagRuns")
        .expect(0)
        .create_async()
        .await;

    let home = tempfile::tempdir().unwrap();
    let config = config(&format!("{}/api/v1", server.url()), true).with_airflow_home(home.path());
    let client = AirflowClient::from_config(&config).unwrap();

    let report = SelfCheck::new(client, &config.etl_dag)
        .with_check(Box::new(FilesystemCheck::new(config.required_dirs())))
        .run()
        .await;

    assert!(!report.required_passed());
    assert!(report.triggered.is_none());
    trigger.assert_async().await;
}
