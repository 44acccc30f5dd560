//! REST client for the platform's stable API.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DeploymentConfig;
use crate::error::AirflowError;

/// Component health as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ComponentHealth {
    pub status: Option<String>,
    #[serde(default)]
    pub latest_scheduler_heartbeat: Option<String>,
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        self.status.as_deref() == Some("healthy")
    }
}

/// Response of `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub metadatabase: ComponentHealth,
    pub scheduler: ComponentHealth,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.metadatabase.is_healthy() && self.scheduler.is_healthy()
    }
}

/// A registered DAG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Dag {
    pub dag_id: String,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub fileloc: Option<String>,
}

/// One run of a DAG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DagRun {
    pub dag_run_id: String,
    pub dag_id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub run_type: Option<String>,
    #[serde(default)]
    pub execution_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DagRunCollection {
    dag_runs: Vec<DagRun>,
}

/// A platform connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: String,
    pub conn_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Connection {
    /// The `postgres_default` connection pointing at the pipeline database.
    /// No password is stored.
    pub fn postgres_default(config: &DeploymentConfig) -> Self {
        Self {
            connection_id: "postgres_default".to_string(),
            conn_type: "postgres".to_string(),
            host: Some(config.postgres_host.clone()),
            schema: Some(config.pipeline_db.clone()),
            login: Some(config.postgres_user.clone()),
            port: Some(config.postgres_port),
            password: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiProblem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Client for the `/api/v1` REST API with basic authentication.
#[derive(Debug, Clone)]
pub struct AirflowClient {
    base_url: String,
    credentials: Option<(String, String)>,
    http_client: Client,
}

impl AirflowClient {
    /// Creates a client for `base_url`, which must include `/api/v1`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, AirflowError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AirflowError::RequestFailed(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
            http_client,
        })
    }

    /// Creates a client authenticated as the configured admin user.
    pub fn from_config(config: &DeploymentConfig) -> Result<Self, AirflowError> {
        let client = Self::new(&config.airflow_api_url)?;
        Ok(match config.admin {
            Some(ref admin) => client.with_basic_auth(&admin.username, &admin.password),
            None => client,
        })
    }

    /// Builder method to set basic auth credentials.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials {
            Some((ref user, ref password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AirflowError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        let message = match serde_json::from_str::<ApiProblem>(&body) {
            Ok(problem) => problem.detail.or(problem.title).unwrap_or(body),
            Err(_) => body,
        };
        Err(AirflowError::ApiError {
            code: status.as_u16(),
            message,
        })
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, AirflowError> {
        response
            .json()
            .await
            .map_err(|e| AirflowError::ParseError(e.to_string()))
    }

    /// Returns `None` on 404, the value otherwise.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, AirflowError> {
        match self.send(self.http_client.get(self.url(path))).await {
            Ok(response) => Ok(Some(Self::parse(response).await?)),
            Err(AirflowError::ApiError { code, .. }) if code == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Health of the metadata database and scheduler.
    pub async fn health(&self) -> Result<HealthStatus, AirflowError> {
        let response = self.send(self.http_client.get(self.url("/health"))).await?;
        Self::parse(response).await
    }

    /// Returns the DAG, or `None` if it is not registered.
    pub async fn get_dag(&self, dag_id: &str) -> Result<Option<Dag>, AirflowError> {
        self.get_optional(&format!("/dags/{}", urlencoding::encode(dag_id)))
            .await
    }

    /// Polls until the DAG is registered.
    ///
    /// Request failures count as "not yet registered" so the poll tolerates a
    /// webserver that is still starting.
    pub async fn wait_for_dag(
        &self,
        dag_id: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<Dag, AirflowError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.get_dag(dag_id).await {
                Ok(Some(dag)) => {
                    info!(dag_id = %dag_id, attempt = attempt, "DAG registered");
                    return Ok(dag);
                }
                Ok(None) => {
                    debug!(dag_id = %dag_id, attempt = attempt, "DAG not registered yet");
                }
                Err(e) => {
                    warn!(dag_id = %dag_id, attempt = attempt, error = %e, "DAG lookup failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(AirflowError::DagNotRegistered {
            dag_id: dag_id.to_string(),
            attempts,
        })
    }

    /// Pauses or unpauses a DAG. Returns false when it already was in the
    /// requested state.
    pub async fn set_paused(&self, dag_id: &str, paused: bool) -> Result<bool, AirflowError> {
        let dag = self.get_dag(dag_id).await?.ok_or_else(|| AirflowError::ApiError {
            code: StatusCode::NOT_FOUND.as_u16(),
            message: format!("DAG '{}' not found", dag_id),
        })?;
        if dag.is_paused == paused {
            debug!(dag_id = %dag_id, paused = paused, "DAG already in requested state");
            return Ok(false);
        }

        let url = self.url(&format!(
            "/dags/{}?update_mask=is_paused",
            urlencoding::encode(dag_id)
        ));
        let request = self
            .http_client
            .patch(url)
            .json(&serde_json::json!({ "is_paused": paused }));
        self.send(request).await?;

        info!(dag_id = %dag_id, paused = paused, "DAG pause state changed");
        Ok(true)
    }

    /// Creates a DAG run.
    pub async fn trigger_dag(
        &self,
        dag_id: &str,
        conf: Option<serde_json::Value>,
    ) -> Result<DagRun, AirflowError> {
        let url = self.url(&format!("/dags/{}/dagRuns", urlencoding::encode(dag_id)));
        let body = serde_json::json!({ "conf": conf.unwrap_or_else(|| serde_json::json!({})) });
        let response = self.send(self.http_client.post(url).json(&body)).await?;
        let run: DagRun = Self::parse(response).await?;

        info!(dag_id = %dag_id, dag_run_id = %run.dag_run_id, "DAG triggered");
        Ok(run)
    }

    /// Lists runs of a DAG.
    pub async fn list_dag_runs(&self, dag_id: &str) -> Result<Vec<DagRun>, AirflowError> {
        let url = self.url(&format!("/dags/{}/dagRuns", urlencoding::encode(dag_id)));
        let response = self.send(self.http_client.get(url)).await?;
        let runs: DagRunCollection = Self::parse(response).await?;
        Ok(runs.dag_runs)
    }

    /// Returns the connection, or `None` if it does not exist.
    pub async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>, AirflowError> {
        self.get_optional(&format!("/connections/{}", urlencoding::encode(connection_id)))
            .await
    }

    /// Creates the connection unless it exists. Returns true if created.
    pub async fn ensure_connection(&self, connection: &Connection) -> Result<bool, AirflowError> {
        if self.get_connection(&connection.connection_id).await?.is_some() {
            debug!(connection_id = %connection.connection_id, "Connection exists");
            return Ok(false);
        }

        let request = self.http_client.post(self.url("/connections")).json(connection);
        self.send(request).await?;
        info!(
            connection_id = %connection.connection_id,
            conn_type = %connection.conn_type,
            "Connection created"
        );
        Ok(true)
    }
}
