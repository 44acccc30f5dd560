//! Deployment manifests.
//!
//! This module provides:
//! - A compose-compatible manifest model with variable interpolation
//! - A builder for the reference Airflow deployment
//! - Static checks for unreliable startup ordering

pub mod builder;
pub mod interpolate;
pub mod lint;
pub mod model;

pub use builder::{
    reference_deployment, DeploymentBuilder, INIT_SERVICE, PGADMIN_SERVICE, POSTGRES_SERVICE,
    SCHEDULER_SERVICE, TRIGGER_SERVICE, WEBSERVER_SERVICE,
};
pub use interpolate::interpolate;
pub use lint::{has_errors, lint, Finding, FindingKind, Severity};
pub use model::{
    format_duration, parse_duration, split_words, CommandSpec, DependencyCondition,
    DependencySpec, Deployment, HealthCheck, Lifecycle, ProbeTest, RestartPolicy, ServiceSpec,
    VolumeSpec,
};
