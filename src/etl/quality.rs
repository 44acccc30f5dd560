//! Data-quality expectations.
//!
//! An `ExpectationSuite` is a named list of expectations evaluated against a
//! `Dataset`. Suites are persisted as JSON so they can be reviewed and edited
//! outside the pipeline.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::EtlError;

use super::transform::FlightRecord;

/// Statuses the flight data source reports.
pub const FLIGHT_STATUSES: [&str; 7] = [
    "active",
    "scheduled",
    "landed",
    "cancelled",
    "diverted",
    "incident",
    "delayed",
];

/// Column-oriented table of optional string cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Dataset {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_records(records: &[FlightRecord]) -> Self {
        let mut dataset = Self::new(FlightRecord::COLUMNS);
        dataset.rows = records.iter().map(FlightRecord::values).collect();
        dataset
    }

    /// Appends a row. Missing trailing cells are null.
    pub fn push_row(&mut self, mut row: Vec<Option<String>>) {
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Values of one column, or `None` if the column does not exist.
    pub fn column<'a>(&'a self, column: &str) -> Option<impl Iterator<Item = Option<&'a str>> + 'a> {
        let idx = self.columns.iter().position(|c| c == column)?;
        Some(self.rows.iter().map(move |row| row.get(idx).and_then(|v| v.as_deref())))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One expectation, serialized as `{"expectation": ..., "kwargs": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "expectation", content = "kwargs")]
pub enum Expectation {
    #[serde(rename = "expect_column_to_exist")]
    ColumnExists { column: String },

    /// Nulls are ignored.
    #[serde(rename = "expect_column_values_to_be_in_set")]
    ValuesInSet { column: String, value_set: Vec<String> },

    /// Nulls are ignored.
    #[serde(rename = "expect_column_values_to_not_match_regex")]
    ValuesNotMatchRegex { column: String, regex: String },

    #[serde(rename = "expect_column_values_to_not_be_null")]
    ValuesNotNull { column: String },
}

impl Expectation {
    pub fn column_exists(column: impl Into<String>) -> Self {
        Expectation::ColumnExists {
            column: column.into(),
        }
    }

    pub fn values_in_set<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expectation::ValuesInSet {
            column: column.into(),
            value_set: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn values_not_match_regex(column: impl Into<String>, regex: impl Into<String>) -> Self {
        Expectation::ValuesNotMatchRegex {
            column: column.into(),
            regex: regex.into(),
        }
    }

    pub fn values_not_null(column: impl Into<String>) -> Self {
        Expectation::ValuesNotNull {
            column: column.into(),
        }
    }

    /// Name as written in suites.
    pub fn kind(&self) -> &'static str {
        match self {
            Expectation::ColumnExists { .. } => "expect_column_to_exist",
            Expectation::ValuesInSet { .. } => "expect_column_values_to_be_in_set",
            Expectation::ValuesNotMatchRegex { .. } => "expect_column_values_to_not_match_regex",
            Expectation::ValuesNotNull { .. } => "expect_column_values_to_not_be_null",
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Expectation::ColumnExists { column }
            | Expectation::ValuesInSet { column, .. }
            | Expectation::ValuesNotMatchRegex { column, .. }
            | Expectation::ValuesNotNull { column } => column,
        }
    }

    /// Evaluates the expectation.
    ///
    /// # Errors
    ///
    /// Returns `EtlError::InvalidExpectation` if a regex does not compile.
    pub fn evaluate(&self, dataset: &Dataset) -> Result<ExpectationResult, EtlError> {
        let column = self.column();
        let Some(values) = dataset.column(column) else {
            return Ok(ExpectationResult::failed(self, 0, format!("column '{}' is missing", column)));
        };

        let (unexpected, sample): (usize, Option<String>) = match self {
            Expectation::ColumnExists { .. } => (0, None),
            Expectation::ValuesInSet { value_set, .. } => count_unexpected(values.flatten(), |v| {
                !value_set.iter().any(|allowed| allowed == v)
            }),
            Expectation::ValuesNotMatchRegex { regex, .. } => {
                let re = Regex::new(regex).map_err(|e| {
                    EtlError::InvalidExpectation(format!("{} on '{}': {}", self.kind(), column, e))
                })?;
                count_unexpected(values.flatten(), |v| re.is_match(v))
            }
            Expectation::ValuesNotNull { .. } => {
                let nulls = values.filter(Option::is_none).count();
                (nulls, None)
            }
        };

        if unexpected == 0 {
            Ok(ExpectationResult::passed(self))
        } else {
            let observed = match sample {
                Some(value) => format!("{} unexpected values, e.g. '{}'", unexpected, value),
                None => format!("{} unexpected values", unexpected),
            };
            Ok(ExpectationResult::failed(self, unexpected, observed))
        }
    }
}

fn count_unexpected<'a, I, F>(values: I, is_unexpected: F) -> (usize, Option<String>)
where
    I: Iterator<Item = &'a str>,
    F: Fn(&str) -> bool,
{
    let mut count = 0;
    let mut sample = None;
    for value in values.filter(|v| is_unexpected(*v)) {
        count += 1;
        if sample.is_none() {
            sample = Some(value.to_string());
        }
    }
    (count, sample)
}

/// Result of one expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationResult {
    pub expectation: Expectation,
    pub success: bool,
    pub unexpected_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
}

impl ExpectationResult {
    fn passed(expectation: &Expectation) -> Self {
        Self {
            expectation: expectation.clone(),
            success: true,
            unexpected_count: 0,
            observed: None,
        }
    }

    fn failed(expectation: &Expectation, unexpected_count: usize, observed: String) -> Self {
        Self {
            expectation: expectation.clone(),
            success: false,
            unexpected_count,
            observed: Some(observed),
        }
    }
}

/// Result of validating a dataset against a suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub suite: String,
    pub success: bool,
    pub evaluated_at: DateTime<Utc>,
    pub rows: usize,
    pub results: Vec<ExpectationResult>,
}

impl ValidationResult {
    pub fn failed(&self) -> impl Iterator<Item = &ExpectationResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }
}

/// Named list of expectations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationSuite {
    pub name: String,
    pub expectations: Vec<Expectation>,
}

impl ExpectationSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expectations: Vec::new(),
        }
    }

    /// Builder method to add an expectation.
    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    /// Path of the suite file under `dir`.
    pub fn path_in(dir: &Path, name: &str) -> PathBuf {
        dir.join("expectations").join(format!("{}.json", name))
    }

    pub async fn save(&self, dir: &Path) -> Result<PathBuf, EtlError> {
        let path = Self::path_in(dir, &self.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_string_pretty(self)?).await?;
        Ok(path)
    }

    pub async fn load(dir: &Path, name: &str) -> Result<Self, EtlError> {
        let content = tokio::fs::read_to_string(Self::path_in(dir, name)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Loads the suite from `dir`, or saves `default` there and returns it.
    pub async fn load_or_create(dir: &Path, default: ExpectationSuite) -> Result<Self, EtlError> {
        if tokio::fs::try_exists(Self::path_in(dir, &default.name)).await? {
            return Self::load(dir, &default.name).await;
        }
        let path = default.save(dir).await?;
        info!(suite = %default.name, path = %path.display(), "Created expectation suite");
        Ok(default)
    }

    /// Evaluates every expectation.
    pub fn validate(&self, dataset: &Dataset) -> Result<ValidationResult, EtlError> {
        let results = self
            .expectations
            .iter()
            .map(|e| e.evaluate(dataset))
            .collect::<Result<Vec<_>, _>>()?;
        let success = results.iter().all(|r| r.success);

        let result = ValidationResult {
            suite: self.name.clone(),
            success,
            evaluated_at: Utc::now(),
            rows: dataset.len(),
            results,
        };

        if success {
            info!(suite = %self.name, checks = result.results.len(), "All data quality checks passed");
        } else {
            warn!(
                suite = %self.name,
                failed = result.failed_count(),
                total = result.results.len(),
                "Data quality checks failed"
            );
            for (i, failed) in result.failed().enumerate() {
                warn!(
                    index = i + 1,
                    expectation = failed.expectation.kind(),
                    column = failed.expectation.column(),
                    observed = ?failed.observed,
                    "Failed expectation"
                );
            }
        }

        Ok(result)
    }
}

/// Suite for transformed flight rows.
pub fn flight_data_suite() -> ExpectationSuite {
    let mut suite = ExpectationSuite::new("flight_data_suite");
    for column in FlightRecord::COLUMNS {
        suite = suite.expect(Expectation::column_exists(column));
    }
    suite
        .expect(Expectation::values_in_set("flight_status", FLIGHT_STATUSES))
        .expect(Expectation::values_not_match_regex("departure_timezone", ".*/.*"))
        .expect(Expectation::values_not_match_regex("arrival_timezone", ".*/.*"))
        .expect(Expectation::values_not_match_regex("arrival_terminal", ".*/.*"))
}
