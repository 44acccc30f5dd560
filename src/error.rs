//! Error types for flightdeck operations.
//!
//! Defines error types for the subsystems that do not own their own:
//! - Deployment manifest parsing and validation
//! - Service runtimes (Docker, local processes)
//! - External command execution
//! - Orchestration platform access (CLI and REST API)
//! - The flight ETL pipeline

use thiserror::Error;

/// Errors that can occur while loading or validating a deployment manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid duration '{0}': expected compose syntax such as 500ms, 10s or 1m30s")]
    InvalidDuration(String),

    #[error("Invalid restart policy '{0}'")]
    InvalidRestartPolicy(String),

    #[error("Invalid health check test for '{service}': {message}")]
    InvalidProbe { service: String, message: String },

    #[error("Unterminated variable reference in '{0}'")]
    UnterminatedVariable(String),

    #[error("Required variable '{name}' is not set: {message}")]
    RequiredVariable { name: String, message: String },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Service '{service}' waits for '{dependency}' to be healthy but it has no health check")]
    HealthConditionWithoutProbe { service: String, dependency: String },

    #[error("Dependency cycle detected between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Manifest defines no services")]
    Empty,
}

/// Errors that can occur while driving services through a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to start service '{service}': {reason}")]
    StartFailed { service: String, reason: String },

    #[error("Service '{0}' has not been started")]
    NotStarted(String),

    #[error("Service '{0}' has neither an image nor a command")]
    NoCommand(String),

    #[error("Probe execution failed for '{service}': {reason}")]
    ProbeFailed { service: String, reason: String },

    #[error("Failed to stop service '{service}': {reason}")]
    StopFailed { service: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("'{program}' timed out after {seconds} seconds")]
    Timeout { program: String, seconds: u64 },
}

/// Errors that can occur while talking to the orchestration platform.
#[derive(Debug, Error)]
pub enum AirflowError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error("DAG '{dag_id}' was not registered after {attempts} attempts")]
    DagNotRegistered { dag_id: String, attempts: u32 },

    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AirflowError {
    fn from(err: reqwest::Error) -> Self {
        AirflowError::RequestFailed(err.to_string())
    }
}

/// Errors that can occur in the flight ETL pipeline.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Missing API key: AVIATIONSTACK_API_KEY is not set")]
    MissingApiKey,

    #[error("Flight API request failed: {0}")]
    RequestFailed(String),

    #[error("Flight API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse flight data: {0}")]
    ParseError(String),

    #[error("Data quality validation failed: {failed} of {total} expectations not met")]
    QualityFailed { failed: usize, total: usize },

    #[error("Invalid expectation: {0}")]
    InvalidExpectation(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::storage::DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for EtlError {
    fn from(err: reqwest::Error) -> Self {
        EtlError::RequestFailed(err.to_string())
    }
}
