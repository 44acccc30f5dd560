//! Pipeline database schema and SQL text.

/// Seed table read by the self-check.
pub const CREATE_TESTDATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS testdata (
    id SERIAL PRIMARY KEY,
    nombre VARCHAR(100),
    edad INTEGER,
    ciudad VARCHAR(100)
)
"#;

/// Flight rows loaded by the ETL pipeline.
pub const CREATE_FLIGHTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS flights (
    id BIGSERIAL PRIMARY KEY,
    flight_date DATE NOT NULL,
    flight_status VARCHAR(32),
    departure_airport VARCHAR(255) NOT NULL DEFAULT '',
    departure_timezone VARCHAR(64),
    arrival_airport VARCHAR(255),
    arrival_timezone VARCHAR(64),
    arrival_terminal VARCHAR(32),
    airline_name VARCHAR(255),
    flight_number VARCHAR(16) NOT NULL,
    loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (flight_date, flight_number, departure_airport)
)
"#;

pub const CREATE_FLIGHTS_DATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_flights_flight_date ON flights(flight_date)";

pub const CREATE_FLIGHTS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_flights_status ON flights(flight_status)";

pub const INSERT_FLIGHT: &str = r#"
INSERT INTO flights (
    flight_date, flight_status, departure_airport, departure_timezone,
    arrival_airport, arrival_timezone, arrival_terminal, airline_name, flight_number
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (flight_date, flight_number, departure_airport) DO NOTHING
"#;

pub const INSERT_SEED_ROW: &str = "INSERT INTO testdata (nombre, edad, ciudad) VALUES ($1, $2, $3)";

/// Key of the transaction-scoped advisory lock taken by the seed bootstrap.
pub const SEED_LOCK_KEY: i64 = 0x666c_6967_6f6f;

/// Schema statements in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TESTDATA_TABLE,
        CREATE_FLIGHTS_TABLE,
        CREATE_FLIGHTS_DATE_INDEX,
        CREATE_FLIGHTS_STATUS_INDEX,
    ]
}
