//! flightdeck: deployment harness for the flight data platform.
//!
//! This library models a multi-service deployment, brings it up in
//! dependency order, runs the one-shot provisioning jobs and the flight ETL
//! pipeline that the deployment hosts.

// Core modules
pub mod airflow;
pub mod cli;
pub mod compose;
pub mod config;
pub mod error;
pub mod etl;
pub mod metrics;
pub mod probe;
pub mod runtime;
pub mod selfcheck;
pub mod sequencer;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, DeploymentConfig};
pub use error::{AirflowError, CommandError, EtlError, ManifestError, RuntimeError};
pub use sequencer::{DeploymentReport, Sequencer, SequencerConfig, SequencerError};
