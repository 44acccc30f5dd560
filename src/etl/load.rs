//! Flight sinks.

use async_trait::async_trait;
use tracing::info;

use crate::error::EtlError;
use crate::storage::Database;

use super::transform::FlightRecord;

/// Destination for transformed flights.
#[async_trait]
pub trait FlightSink: Send + Sync {
    fn name(&self) -> &str;

    /// Loads the records and returns how many were newly stored.
    async fn load(&self, records: &[FlightRecord]) -> Result<u64, EtlError>;
}

/// Loads into the `flights` table of the pipeline database.
pub struct PostgresSink {
    db: Database,
}

impl PostgresSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FlightSink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn load(&self, records: &[FlightRecord]) -> Result<u64, EtlError> {
        let inserted = self.db.insert_flights(records).await?;
        info!(
            sink = "postgres",
            offered = records.len(),
            inserted = inserted,
            "Loaded flights"
        );
        Ok(inserted)
    }
}

/// Logs the records instead of storing them.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl FlightSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn load(&self, records: &[FlightRecord]) -> Result<u64, EtlError> {
        for record in records {
            info!(
                flight_date = %record.flight_date,
                flight_number = %record.flight_number,
                status = ?record.flight_status,
                from = ?record.departure_airport,
                to = ?record.arrival_airport,
                "Flight"
            );
        }
        Ok(records.len() as u64)
    }
}
