//! Command-line interface for flightdeck.
//!
//! Provides commands for manifest rendering and linting, bringing the
//! deployment up, the provisioning jobs and the ETL pipeline.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, RuntimeKind};
