//! Extract, transform, validate, load.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EtlError;
use crate::metrics::MetricsCollector;

use super::extract::FlightSource;
use super::load::FlightSink;
use super::quality::{flight_data_suite, Dataset, ExpectationSuite, ValidationResult};
use super::transform::transform;

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct EtlReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub extracted: usize,
    pub transformed: usize,
    pub dropped: usize,
    pub validation: ValidationResult,
    pub loaded: u64,
}

/// The flight pipeline. Extracts once and feeds the same batch through
/// every later stage.
pub struct EtlPipeline {
    source: Box<dyn FlightSource>,
    sink: Box<dyn FlightSink>,
    suite: ExpectationSuite,
    quality_dir: Option<PathBuf>,
    strict: bool,
    metrics: MetricsCollector,
}

impl EtlPipeline {
    pub fn new(source: Box<dyn FlightSource>, sink: Box<dyn FlightSink>) -> Self {
        Self {
            source,
            sink,
            suite: flight_data_suite(),
            quality_dir: None,
            strict: false,
            metrics: MetricsCollector::new(),
        }
    }

    /// Builder method to persist and reuse the suite under `dir`.
    pub fn with_quality_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.quality_dir = Some(dir.into());
        self
    }

    /// Builder method to replace the default suite.
    pub fn with_suite(mut self, suite: ExpectationSuite) -> Self {
        self.suite = suite;
        self
    }

    /// Builder method to make failed expectations fatal.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Runs the pipeline.
    ///
    /// # Errors
    ///
    /// Extraction and load errors are returned. Failed expectations only
    /// fail the run in strict mode.
    pub async fn run(&self) -> Result<EtlReport, EtlError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(run_id = %run_id, source = self.source.name(), sink = self.sink.name(), "Starting ETL run");

        let raw = self.source.fetch().await?;
        self.metrics.record_etl_rows("extract", raw.len());

        let transformed = transform(&raw);
        self.metrics.record_etl_rows("transform", transformed.records.len());

        let suite = match self.quality_dir {
            Some(ref dir) => ExpectationSuite::load_or_create(dir, self.suite.clone()).await?,
            None => self.suite.clone(),
        };
        let validation = suite.validate(&Dataset::from_records(&transformed.records))?;
        for result in &validation.results {
            self.metrics
                .record_expectation(result.expectation.kind(), result.success);
        }

        if let Some(ref dir) = self.quality_dir {
            let path = dir
                .join("validations")
                .join(format!("{}-{}.json", suite.name, run_id));
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, serde_json::to_string_pretty(&validation)?).await?;
        }

        if !validation.success {
            if self.strict {
                return Err(EtlError::QualityFailed {
                    failed: validation.failed_count(),
                    total: validation.results.len(),
                });
            }
            warn!(
                failed = validation.failed_count(),
                "Some data quality checks failed, continuing"
            );
        }

        let loaded = self.sink.load(&transformed.records).await?;
        self.metrics.record_etl_rows("load", loaded as usize);

        let report = EtlReport {
            run_id,
            started_at,
            elapsed: started.elapsed(),
            extracted: raw.len(),
            transformed: transformed.records.len(),
            dropped: transformed.dropped.len(),
            validation,
            loaded,
        };
        info!(
            run_id = %run_id,
            extracted = report.extracted,
            transformed = report.transformed,
            loaded = report.loaded,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "ETL run complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::extract::{ApiEndpoint, ApiFlightNumber, RawFlight};
    use crate::etl::transform::FlightRecord;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FixedSource {
        flights: Vec<RawFlight>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FlightSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self) -> Result<Vec<RawFlight>, EtlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.flights.clone())
        }
    }

    #[derive(Default, Clone)]
    struct MemorySink {
        stored: Arc<Mutex<Vec<FlightRecord>>>,
    }

    #[async_trait]
    impl FlightSink for MemorySink {
        fn name(&self) -> &str {
            "memory"
        }

        async fn load(&self, records: &[FlightRecord]) -> Result<u64, EtlError> {
            self.stored.lock().unwrap().extend_from_slice(records);
            Ok(records.len() as u64)
        }
    }

    fn flight(number: Option<&str>, status: &str, terminal: &str) -> RawFlight {
        RawFlight {
            flight_date: Some("2024-03-01".to_string()),
            flight_status: Some(status.to_string()),
            departure: Some(ApiEndpoint {
                airport: Some("Sevilla".to_string()),
                timezone: Some("Europe/Madrid".to_string()),
                ..Default::default()
            }),
            arrival: Some(ApiEndpoint {
                airport: Some("Valencia".to_string()),
                timezone: Some("Europe/Madrid".to_string()),
                terminal: Some(terminal.to_string()),
                ..Default::default()
            }),
            airline: None,
            flight: Some(ApiFlightNumber {
                number: number.map(str::to_string),
                iata: None,
            }),
        }
    }

    fn pipeline(flights: Vec<RawFlight>) -> (EtlPipeline, Arc<AtomicUsize>, MemorySink) {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = MemorySink::default();
        let pipeline = EtlPipeline::new(
            Box::new(FixedSource {
                flights,
                calls: Arc::clone(&calls),
            }),
            Box::new(sink.clone()),
        );
        (pipeline, calls, sink)
    }

    #[tokio::test]
    async fn test_run_extracts_once_and_loads() {
        let (pipeline, calls, sink) = pipeline(vec![
            flight(Some("1"), "landed", "T4/S"),
            flight(None, "landed", "1"),
            flight(Some("2"), "scheduled", "2"),
        ]);

        let report = pipeline.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.extracted, 3);
        assert_eq!(report.transformed, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.loaded, 2);
        assert!(report.validation.success);

        let stored = sink.stored.lock().unwrap();
        assert_eq!(stored[0].arrival_terminal.as_deref(), Some("T4-S"));
    }

    #[tokio::test]
    async fn test_quality_failure_is_not_fatal_by_default() {
        let (pipeline, _, sink) = pipeline(vec![flight(Some("1"), "boarding", "1")]);

        let report = pipeline.run().await.unwrap();

        assert!(!report.validation.success);
        assert_eq!(report.validation.failed_count(), 1);
        assert_eq!(sink.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_strict_mode_blocks_load() {
        let (pipeline, _, sink) = pipeline(vec![flight(Some("1"), "boarding", "1")]);

        let err = pipeline.strict(true).run().await.unwrap_err();

        assert!(matches!(err, EtlError::QualityFailed { failed: 1, total: 13 }));
        assert!(sink.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quality_dir_receives_suite_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _, _) = pipeline(vec![flight(Some("1"), "active", "1")]);

        let report = pipeline.with_quality_dir(dir.path()).run().await.unwrap();

        assert!(ExpectationSuite::path_in(dir.path(), "flight_data_suite").exists());
        let validation = dir
            .path()
            .join("validations")
            .join(format!("flight_data_suite-{}.json", report.run_id));
        assert!(validation.exists());
    }
}
