//! Recording helpers for flightdeck metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites never
//! have to check whether metrics were initialized.

use std::time::Duration;

use super::prometheus::{
    ETL_ROWS, JOB_ATTEMPTS, PROBE_ATTEMPTS, PROBE_DURATION, QUALITY_EXPECTATIONS,
    SERVICE_RESTARTS, SERVICE_STATE, STARTUP_DURATION,
};

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Metrics collector for recording flightdeck operational metrics.
///
/// Recording is a no-op until `init_metrics()` has been called.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one probe execution.
    pub fn record_probe(&self, service: &str, success: bool, elapsed: Duration) {
        if let Some(attempts) = PROBE_ATTEMPTS.get() {
            attempts.with_label_values(&[service, outcome(success)]).inc();
        }
        if let Some(duration) = PROBE_DURATION.get() {
            duration
                .with_label_values(&[service])
                .observe(elapsed.as_secs_f64());
        }

        tracing::trace!(service = service, success = success, "Recorded probe metric");
    }

    /// Record one job attempt.
    pub fn record_job_attempt(&self, service: &str, success: bool) {
        if let Some(attempts) = JOB_ATTEMPTS.get() {
            attempts.with_label_values(&[service, outcome(success)]).inc();
        }
    }

    /// Set the readiness state code for a service.
    pub fn set_service_state(&self, service: &str, code: i64) {
        if let Some(state) = SERVICE_STATE.get() {
            state.with_label_values(&[service]).set(code as f64);
        }
    }

    /// Record a supervised restart.
    pub fn record_restart(&self, service: &str) {
        if let Some(restarts) = SERVICE_RESTARTS.get() {
            restarts.with_label_values(&[service]).inc();
        }
    }

    /// Record how long startup took to settle.
    pub fn record_startup(&self, elapsed: Duration) {
        if let Some(startup) = STARTUP_DURATION.get() {
            startup.observe(elapsed.as_secs_f64());
        }
    }

    /// Record rows handled by an ETL stage.
    pub fn record_etl_rows(&self, stage: &str, rows: usize) {
        if let Some(counter) = ETL_ROWS.get() {
            counter.with_label_values(&[stage]).inc_by(rows as f64);
        }
    }

    /// Record an expectation result.
    pub fn record_expectation(&self, expectation: &str, success: bool) {
        if let Some(counter) = QUALITY_EXPECTATIONS.get() {
            counter
                .with_label_values(&[expectation, outcome(success)])
                .inc();
        }
    }
}
