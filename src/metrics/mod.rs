//! Metrics module for Prometheus-based monitoring.
//!
//! Covers probe and job attempts, readiness states, supervised restarts and
//! ETL row counts.
//!
//! # Example
//!
//! ```ignore
//! use flightdeck::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_job_attempt("airflow-init", true);
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ETL_ROWS, JOB_ATTEMPTS, PROBE_ATTEMPTS, PROBE_DURATION, QUALITY_EXPECTATIONS, REGISTRY,
    SERVICE_RESTARTS, SERVICE_STATE, STARTUP_DURATION,
};
