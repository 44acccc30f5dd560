//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by flightdeck and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, GaugeVec, Histogram, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all flightdeck metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Probe executions, labeled by service and result (success/failure).
pub static PROBE_ATTEMPTS: OnceLock<CounterVec> = OnceLock::new();

/// Probe execution time in seconds, labeled by service.
pub static PROBE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// One-shot job attempts, labeled by service and result.
pub static JOB_ATTEMPTS: OnceLock<CounterVec> = OnceLock::new();

/// Current readiness state code per service.
pub static SERVICE_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Restarts performed while supervising, labeled by service.
pub static SERVICE_RESTARTS: OnceLock<CounterVec> = OnceLock::new();

/// Time from `up` to settled startup.
pub static STARTUP_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Flight rows processed, labeled by pipeline stage.
pub static ETL_ROWS: OnceLock<CounterVec> = OnceLock::new();

/// Expectation results, labeled by expectation type and outcome.
pub static QUALITY_EXPECTATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless; later calls keep the first set
/// of metrics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Sequencer metrics
    let probe_attempts = CounterVec::new(
        Opts::new("flightdeck_probe_attempts_total", "Health probe executions"),
        &["service", "result"],
    )?;

    let probe_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "flightdeck_probe_duration_seconds",
            "Health probe execution time in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        &["service"],
    )?;

    let job_attempts = CounterVec::new(
        Opts::new("flightdeck_job_attempts_total", "One-shot job attempts"),
        &["service", "result"],
    )?;

    let service_state = GaugeVec::new(
        Opts::new(
            "flightdeck_service_state",
            "Readiness state code (0 pending, 1 starting, 2 running, 3 healthy, 4 unhealthy, 5 completed, 6 failed)",
        ),
        &["service"],
    )?;

    let service_restarts = CounterVec::new(
        Opts::new("flightdeck_service_restarts_total", "Service restarts while supervising"),
        &["service"],
    )?;

    let startup_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "flightdeck_startup_duration_seconds",
            "Time for a deployment to settle",
        )
        .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    // Pipeline metrics
    let etl_rows = CounterVec::new(
        Opts::new("flightdeck_etl_rows_total", "Flight rows processed per stage"),
        &["stage"],
    )?;

    let quality_expectations = CounterVec::new(
        Opts::new(
            "flightdeck_quality_expectations_total",
            "Data quality expectation results",
        ),
        &["expectation", "outcome"],
    )?;

    registry.register(Box::new(probe_attempts.clone()))?;
    registry.register(Box::new(probe_duration.clone()))?;
    registry.register(Box::new(job_attempts.clone()))?;
    registry.register(Box::new(service_state.clone()))?;
    registry.register(Box::new(service_restarts.clone()))?;
    registry.register(Box::new(startup_duration.clone()))?;
    registry.register(Box::new(etl_rows.clone()))?;
    registry.register(Box::new(quality_expectations.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = PROBE_ATTEMPTS.set(probe_attempts);
    let _ = PROBE_DURATION.set(probe_duration);
    let _ = JOB_ATTEMPTS.set(job_attempts);
    let _ = SERVICE_STATE.set(service_state);
    let _ = SERVICE_RESTARTS.set(service_restarts);
    let _ = STARTUP_DURATION.set(startup_duration);
    let _ = ETL_ROWS.set(etl_rows);
    let _ = QUALITY_EXPECTATIONS.set(quality_expectations);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_repeatable() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = PROBE_ATTEMPTS.get() {
            counter.with_label_values(&["postgres", "success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("flightdeck_probe_attempts_total"));
    }
}
