//! Flattening and cleanup of extracted flights.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::extract::RawFlight;

/// Flattened flight row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightRecord {
    pub flight_date: NaiveDate,
    pub flight_status: Option<String>,
    pub departure_airport: Option<String>,
    pub departure_timezone: Option<String>,
    pub arrival_airport: Option<String>,
    pub arrival_timezone: Option<String>,
    pub arrival_terminal: Option<String>,
    pub airline_name: Option<String>,
    pub flight_number: String,
}

impl FlightRecord {
    /// Column names in table order.
    pub const COLUMNS: [&'static str; 9] = [
        "flight_date",
        "flight_status",
        "departure_airport",
        "departure_timezone",
        "arrival_airport",
        "arrival_timezone",
        "arrival_terminal",
        "airline_name",
        "flight_number",
    ];

    /// Cell values in `COLUMNS` order.
    pub fn values(&self) -> Vec<Option<String>> {
        vec![
            Some(self.flight_date.to_string()),
            self.flight_status.clone(),
            self.departure_airport.clone(),
            self.departure_timezone.clone(),
            self.arrival_airport.clone(),
            self.arrival_timezone.clone(),
            self.arrival_terminal.clone(),
            self.airline_name.clone(),
            Some(self.flight_number.clone()),
        ]
    }
}

/// Why a raw flight was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MissingFlightNumber,
    InvalidFlightDate,
}

/// Result of transforming a batch.
#[derive(Debug, Clone, Default)]
pub struct Transformed {
    pub records: Vec<FlightRecord>,
    pub dropped: Vec<DropReason>,
}

fn clean(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn dehyphenate(value: Option<String>) -> Option<String> {
    value.map(|v| v.replace('/', "-"))
}

/// Flattens one flight. Returns the reason when the row cannot be kept.
pub fn transform_flight(raw: &RawFlight) -> Result<FlightRecord, DropReason> {
    let flight_number = clean(raw.flight.as_ref().and_then(|f| f.number.as_ref()))
        .ok_or(DropReason::MissingFlightNumber)?;
    let flight_date = clean(raw.flight_date.as_ref())
        .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
        .ok_or(DropReason::InvalidFlightDate)?;

    let departure = raw.departure.as_ref();
    let arrival = raw.arrival.as_ref();

    Ok(FlightRecord {
        flight_date,
        flight_status: clean(raw.flight_status.as_ref()).map(|s| s.to_lowercase()),
        departure_airport: clean(departure.and_then(|d| d.airport.as_ref())),
        departure_timezone: dehyphenate(clean(departure.and_then(|d| d.timezone.as_ref()))),
        arrival_airport: clean(arrival.and_then(|a| a.airport.as_ref())),
        arrival_timezone: dehyphenate(clean(arrival.and_then(|a| a.timezone.as_ref()))),
        arrival_terminal: dehyphenate(clean(arrival.and_then(|a| a.terminal.as_ref()))),
        airline_name: clean(raw.airline.as_ref().and_then(|a| a.name.as_ref())),
        flight_number,
    })
}

/// Transforms a batch, dropping rows without a flight number or date.
pub fn transform(raw: &[RawFlight]) -> Transformed {
    let mut out = Transformed::default();
    for flight in raw {
        match transform_flight(flight) {
            Ok(record) => out.records.push(record),
            Err(reason) => {
                debug!(reason = ?reason, "Dropping flight");
                out.dropped.push(reason);
            }
        }
    }

    info!(
        kept = out.records.len(),
        dropped = out.dropped.len(),
        "Transformed flights"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::extract::{ApiAirline, ApiEndpoint, ApiFlightNumber};

    fn raw(number: Option<&str>) -> RawFlight {
        RawFlight {
            flight_date: Some("2024-03-01".to_string()),
            flight_status: Some(" Landed ".to_string()),
            departure: Some(ApiEndpoint {
                airport: Some("Madrid Barajas".to_string()),
                timezone: Some("Europe/Madrid".to_string()),
                ..Default::default()
            }),
            arrival: Some(ApiEndpoint {
                airport: Some("Bilbao".to_string()),
                timezone: Some("Europe/Madrid".to_string()),
                terminal: Some("1/2".to_string()),
                ..Default::default()
            }),
            airline: Some(ApiAirline {
                name: Some("Iberia".to_string()),
                iata: Some("IB".to_string()),
            }),
            flight: Some(ApiFlightNumber {
                number: number.map(str::to_string),
                iata: None,
            }),
        }
    }

    #[test]
    fn test_slashes_replaced() {
        let record = transform_flight(&raw(Some("448"))).unwrap();
        assert_eq!(record.departure_timezone.as_deref(), Some("Europe-Madrid"));
        assert_eq!(record.arrival_timezone.as_deref(), Some("Europe-Madrid"));
        assert_eq!(record.arrival_terminal.as_deref(), Some("1-2"));
        assert_eq!(record.departure_airport.as_deref(), Some("Madrid Barajas"));
        assert_eq!(record.flight_status.as_deref(), Some("landed"));
    }

    #[test]
    fn test_rows_without_number_dropped() {
        let out = transform(&[raw(Some("448")), raw(None), raw(Some("  "))]);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.dropped, vec![DropReason::MissingFlightNumber; 2]);
    }

    #[test]
    fn test_invalid_date_dropped() {
        let mut flight = raw(Some("1"));
        flight.flight_date = Some("03/01/2024".to_string());
        assert_eq!(transform_flight(&flight), Err(DropReason::InvalidFlightDate));
    }

    #[test]
    fn test_missing_nested_sections() {
        let flight = RawFlight {
            flight_date: Some("2024-03-01".to_string()),
            flight: Some(ApiFlightNumber {
                number: Some("7".to_string()),
                iata: None,
            }),
            ..Default::default()
        };
        let record = transform_flight(&flight).unwrap();
        assert_eq!(record.arrival_terminal, None);
        assert_eq!(record.values().len(), FlightRecord::COLUMNS.len());
    }
}
