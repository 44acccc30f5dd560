//! Orchestration platform access.
//!
//! The platform itself is a black box. This module reaches it two ways:
//! - `AirflowCli`: the `airflow` command line, for metadata migration and
//!   user management inside the platform image
//! - `AirflowClient`: the stable REST API (`/api/v1`), for DAG registration,
//!   pausing, triggering and connections
//!
//! `InitJob` and `TriggerJob` are the two one-shot provisioning jobs of the
//! reference deployment. Both are idempotent so they can be retried freely.

pub mod cli;
pub mod client;
pub mod provision;

use serde::{Deserialize, Serialize};

pub use cli::{AirflowCli, CommandOutput, CommandRunner, ShellRunner, UserProvision};
pub use client::{AirflowClient, Connection, Dag, DagRun, HealthStatus};
pub use provision::{InitJob, InitReport, StepStatus, TriggerJob, TriggerReport};

/// Administrative account provisioned in the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUser {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

impl AdminUser {
    /// Creates an `Admin` role account with placeholder profile fields.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            email: format!("{}@example.com", username),
            username,
            password: password.into(),
            first_name: "Admin".to_string(),
            last_name: "User".to_string(),
            role: "Admin".to_string(),
        }
    }

    /// Builder method to set the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}
