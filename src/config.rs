//! Deployment configuration.
//!
//! All deployment-specific secrets and parameters come from the environment,
//! optionally seeded from a `.env` file. Required keys are enumerated up front
//! and checked eagerly so a missing credential fails the process at startup
//! instead of at first use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::airflow::AdminUser;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more required environment variables are missing.
    #[error("Missing environment variables: {}", .0.join(", "))]
    MissingEnvVars(Vec<String>),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("Failed to read env file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Keys that must always be present.
pub const REQUIRED_KEYS: &[&str] = &[
    "POSTGRES_USER",
    "POSTGRES_PASSWORD",
    "POSTGRES_DB",
    "_AIRFLOW_DB_UPGRADE",
    "_AIRFLOW_WWW_USER_CREATE",
];

/// Keys that are required only when `_AIRFLOW_WWW_USER_CREATE` is true.
pub const ADMIN_KEYS: &[&str] = &["_AIRFLOW_WWW_USER_USERNAME", "_AIRFLOW_WWW_USER_PASSWORD"];

/// Configuration shared by every flightdeck component.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    // Relational store
    /// Hostname of the PostgreSQL service.
    pub postgres_host: String,
    /// Port of the PostgreSQL service.
    pub postgres_port: u16,
    /// Database user.
    pub postgres_user: String,
    /// Database password.
    pub postgres_password: String,
    /// Database holding the orchestration metadata.
    pub postgres_db: String,
    /// Database holding the pipeline tables.
    pub pipeline_db: String,

    // Orchestration bootstrap
    /// Whether the init job runs the metadata migration.
    pub db_upgrade: bool,
    /// Whether the admin user is provisioned.
    pub www_user_create: bool,
    /// Admin credentials, present when `www_user_create` is set.
    pub admin: Option<AdminUser>,
    /// Base URL of the REST API, including `/api/v1`.
    pub airflow_api_url: String,
    /// Image used for the Airflow services in the reference deployment.
    pub airflow_image: String,
    /// DAG activated by the trigger job.
    pub health_check_dag: String,
    /// DAG triggered by the self-check workflow.
    pub etl_dag: String,
    /// How many times to poll for DAG registration.
    pub registration_attempts: u32,
    /// Delay between registration polls.
    pub registration_interval: Duration,

    // Pipeline
    /// Airflow home; `dags`, `logs`, `plugins` and `data` live below it.
    pub airflow_home: PathBuf,
    /// API key for the flight data source.
    pub aviationstack_api_key: Option<String>,
    /// Base URL of the flight data source.
    pub aviationstack_url: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            postgres_host: "postgres".to_string(),
            postgres_port: 5432,
            postgres_user: "airflow".to_string(),
            postgres_password: String::new(),
            postgres_db: "airflow".to_string(),
            pipeline_db: "testfligoo".to_string(),

            db_upgrade: true,
            www_user_create: true,
            admin: None,
            airflow_api_url: "http://airflow-webserver:8080/api/v1".to_string(),
            airflow_image: "apache/airflow:2.8.1".to_string(),
            health_check_dag: "health_check_dag".to_string(),
            etl_dag: "pandas_etl_pipeline".to_string(),
            registration_attempts: 30,
            registration_interval: Duration::from_secs(2),

            airflow_home: PathBuf::from("/opt/airflow"),
            aviationstack_api_key: None,
            aviationstack_url: "http://api.aviationstack.com/v1".to_string(),
        }
    }
}

impl DeploymentConfig {
    /// Creates configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from a `.env` file, with the process environment
    /// taking precedence over values in the file.
    pub fn from_env_file(path: &Path) -> Result<Self, ConfigError> {
        let file_vars = load_env_file(path)?;
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file_vars.get(key).cloned()))
    }

    /// Creates configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVars` listing every missing required key,
    /// or `ConfigError::InvalidValue` for the first malformed value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|key| get(key).is_none())
            .map(|key| key.to_string())
            .collect();

        let www_user_create = match get("_AIRFLOW_WWW_USER_CREATE") {
            Some(val) => parse_env_bool(&val, "_AIRFLOW_WWW_USER_CREATE")?,
            None => false,
        };
        if www_user_create {
            missing.extend(
                ADMIN_KEYS
                    .iter()
                    .filter(|key| get(key).is_none())
                    .map(|key| key.to_string()),
            );
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingEnvVars(missing));
        }

        let mut config = Self::default();

        // Relational store
        if let Some(val) = get("POSTGRES_HOST") {
            config.postgres_host = val;
        }
        if let Some(val) = get("POSTGRES_PORT") {
            config.postgres_port = parse_env_value(&val, "POSTGRES_PORT")?;
        }
        config.postgres_user = get("POSTGRES_USER").unwrap_or_default();
        config.postgres_password = get("POSTGRES_PASSWORD").unwrap_or_default();
        config.postgres_db = get("POSTGRES_DB").unwrap_or_default();
        if let Some(val) = get("PIPELINE_DB") {
            config.pipeline_db = val;
        }

        // Orchestration bootstrap
        config.db_upgrade = match get("_AIRFLOW_DB_UPGRADE") {
            Some(val) => parse_env_bool(&val, "_AIRFLOW_DB_UPGRADE")?,
            None => false,
        };
        config.www_user_create = www_user_create;
        if www_user_create {
            let mut admin = AdminUser::new(
                get("_AIRFLOW_WWW_USER_USERNAME").unwrap_or_default(),
                get("_AIRFLOW_WWW_USER_PASSWORD").unwrap_or_default(),
            );
            if let Some(email) = get("_AIRFLOW_WWW_USER_EMAIL") {
                admin.email = email;
            }
            config.admin = Some(admin);
        }
        if let Some(val) = get("AIRFLOW_API_URL") {
            config.airflow_api_url = val.trim_end_matches('/').to_string();
        }
        if let Some(val) = get("AIRFLOW_IMAGE") {
            config.airflow_image = val;
        }
        if let Some(val) = get("HEALTH_CHECK_DAG_ID") {
            config.health_check_dag = val;
        }
        if let Some(val) = get("ETL_DAG_ID") {
            config.etl_dag = val;
        }
        if let Some(val) = get("DAG_REGISTRATION_ATTEMPTS") {
            config.registration_attempts = parse_env_value(&val, "DAG_REGISTRATION_ATTEMPTS")?;
        }
        if let Some(val) = get("DAG_REGISTRATION_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "DAG_REGISTRATION_INTERVAL_SECS")?;
            config.registration_interval = Duration::from_secs(secs);
        }

        // Pipeline
        if let Some(val) = get("AIRFLOW_HOME") {
            config.airflow_home = PathBuf::from(val);
        }
        config.aviationstack_api_key = get("AVIATIONSTACK_API_KEY");
        if let Some(val) = get("AVIATIONSTACK_URL") {
            config.aviationstack_url = val.trim_end_matches('/').to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Admin credentials for the REST API.
    ///
    /// The API only accepts basic auth, so callers that talk to it need the
    /// admin keys even when user creation is off.
    pub fn api_credentials(&self) -> Result<&AdminUser, ConfigError> {
        self.admin
            .as_ref()
            .ok_or_else(|| ConfigError::MissingEnvVars(ADMIN_KEYS.iter().map(|k| k.to_string()).collect()))
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.postgres_port == 0 {
            return Err(ConfigError::ValidationFailed(
                "postgres_port must be greater than 0".to_string(),
            ));
        }

        if self.registration_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "registration_attempts must be greater than 0".to_string(),
            ));
        }

        if let Some(ref admin) = self.admin {
            if admin.username.contains(char::is_whitespace) {
                return Err(ConfigError::ValidationFailed(
                    "admin username cannot contain whitespace".to_string(),
                ));
            }
        }

        if !self.airflow_api_url.starts_with("http://") && !self.airflow_api_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "AIRFLOW_API_URL".to_string(),
                message: "must be an http(s) URL".to_string(),
            });
        }

        Ok(())
    }

    /// Connection URL for a database on the configured server.
    pub fn database_url(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.postgres_user),
            urlencoding::encode(&self.postgres_password),
            self.postgres_host,
            self.postgres_port,
            database
        )
    }

    /// Connection URL for the orchestration metadata database.
    pub fn metadata_database_url(&self) -> String {
        self.database_url(&self.postgres_db)
    }

    /// Connection URL for the pipeline database.
    pub fn pipeline_database_url(&self) -> String {
        self.database_url(&self.pipeline_db)
    }

    /// Directories the self-check requires to exist and be writable.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        ["dags", "logs", "plugins", "data"]
            .iter()
            .map(|d| self.airflow_home.join(d))
            .collect()
    }

    /// Directory holding persisted expectation suites.
    pub fn quality_dir(&self) -> PathBuf {
        self.airflow_home.join("data").join("great_expectations")
    }

    /// Builder method to set the REST API URL.
    pub fn with_airflow_api_url(mut self, url: impl Into<String>) -> Self {
        self.airflow_api_url = url.into();
        self
    }

    /// Builder method to set the Airflow home.
    pub fn with_airflow_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.airflow_home = home.into();
        self
    }
}

/// Reads a `.env` file into a map.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_env_file(&content))
}

/// Parses `.env` content.
///
/// Supports blank lines, `#` comments, an optional `export ` prefix, single or
/// double quoted values and trailing ` #` comments on unquoted values.
pub fn parse_env_file(content: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = value.trim();
        let value = if let Some(inner) = strip_quotes(value) {
            inner.to_string()
        } else {
            match value.find(" #") {
                Some(idx) => value[..idx].trim_end().to_string(),
                None => value.to_string(),
            }
        };

        vars.insert(key.to_string(), value);
    }

    vars
}

fn strip_quotes(value: &str) -> Option<&str> {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return Some(&value[1..value.len() - 1]);
        }
    }
    None
}

/// Parses an environment variable value to the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// Parses a boolean environment variable value.
///
/// Accepts: true, false, 1, 0, yes, no (case-insensitive).
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean (true/false/1/0/yes/no), got '{}'", value),
        }),
    }
}
