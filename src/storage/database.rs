//! PostgreSQL client for the pipeline database.

use regex::Regex;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::etl::FlightRecord;

use super::migrations::MigrationRunner;
use super::schema;

/// SQLSTATE for `duplicate_database`.
const DUPLICATE_DATABASE: &str = "42P04";

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A database or table name is not a plain identifier.
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"))
}

/// Returns the identifier quoted, or an error if it is not a plain identifier.
pub fn quote_identifier(name: &str) -> Result<String, DatabaseError> {
    if identifier_regex().is_match(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// PostgreSQL database client.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the pipeline schema.
    pub async fn run_migrations(&self) -> Result<usize, DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }

    /// Creates the database on this server unless it exists. Returns true if
    /// it was created here.
    pub async fn ensure_database(&self, name: &str) -> Result<bool, DatabaseError> {
        let quoted = quote_identifier(name)?;

        let exists: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            debug!(database = %name, "Database exists");
            return Ok(false);
        }

        match sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&self.pool)
            .await
        {
            Ok(_) => {
                info!(database = %name, "Database created");
                Ok(true)
            }
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(DUPLICATE_DATABASE) => {
                debug!(database = %name, "Database created concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if the table exists in the current schema.
    pub async fn table_exists(&self, table: &str) -> Result<bool, DatabaseError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Number of rows in a table.
    pub async fn row_count(&self, table: &str) -> Result<i64, DatabaseError> {
        let quoted = quote_identifier(table)?;
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", quoted))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Inserts flight rows in one transaction, skipping rows whose natural
    /// key is already present. Returns the number of rows inserted.
    pub async fn insert_flights(&self, records: &[FlightRecord]) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let result = sqlx::query(schema::INSERT_FLIGHT)
                .bind(record.flight_date)
                .bind(&record.flight_status)
                .bind(record.departure_airport.as_deref().unwrap_or(""))
                .bind(&record.departure_timezone)
                .bind(&record.arrival_airport)
                .bind(&record.arrival_timezone)
                .bind(&record.arrival_terminal)
                .bind(&record.airline_name)
                .bind(&record.flight_number)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        debug!(offered = records.len(), inserted = inserted, "Inserted flights");
        Ok(inserted)
    }
}
