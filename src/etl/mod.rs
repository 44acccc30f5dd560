//! Flight ETL pipeline.
//!
//! Flights are extracted from aviationstack (or a JSON file), flattened and
//! cleaned, validated against the `flight_data_suite` expectations and loaded
//! into the `flights` table.

pub mod extract;
pub mod load;
pub mod pipeline;
pub mod quality;
pub mod transform;

pub use extract::{AviationStackClient, FileSource, FlightSource, RawFlight};
pub use load::{FlightSink, LogSink, PostgresSink};
pub use pipeline::{EtlPipeline, EtlReport};
pub use quality::{
    flight_data_suite, Dataset, Expectation, ExpectationResult, ExpectationSuite,
    ValidationResult, FLIGHT_STATUSES,
};
pub use transform::{transform, transform_flight, DropReason, FlightRecord, Transformed};
