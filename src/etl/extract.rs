//! Flight data sources.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::EtlError;

/// Airport side of a flight as returned by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    #[serde(default)]
    pub airport: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub iata: Option<String>,
    #[serde(default)]
    pub terminal: Option<String>,
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub scheduled: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiAirline {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub iata: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFlightNumber {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub iata: Option<String>,
}

/// Nested flight record as returned by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFlight {
    #[serde(default)]
    pub flight_date: Option<String>,
    #[serde(default)]
    pub flight_status: Option<String>,
    #[serde(default)]
    pub departure: Option<ApiEndpoint>,
    #[serde(default)]
    pub arrival: Option<ApiEndpoint>,
    #[serde(default)]
    pub airline: Option<ApiAirline>,
    #[serde(default)]
    pub flight: Option<ApiFlightNumber>,
}

#[derive(Debug, Deserialize)]
struct FlightsResponse {
    #[serde(default)]
    data: Option<Vec<RawFlight>>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Something flight records can be extracted from.
#[async_trait]
pub trait FlightSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<RawFlight>, EtlError>;
}

/// Client for the aviationstack `/flights` endpoint.
pub struct AviationStackClient {
    base_url: String,
    api_key: String,
    limit: u32,
    http_client: Client,
}

impl AviationStackClient {
    /// Creates a client. Fails with `MissingApiKey` on an empty key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, EtlError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(EtlError::MissingApiKey);
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| EtlError::RequestFailed(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            limit: 100,
            http_client,
        })
    }

    /// Builder method to set the page size.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
impl FlightSource for AviationStackClient {
    fn name(&self) -> &str {
        "aviationstack"
    }

    async fn fetch(&self) -> Result<Vec<RawFlight>, EtlError> {
        let url = format!(
            "{}/flights?access_key={}&limit={}",
            self.base_url,
            urlencoding::encode(&self.api_key),
            self.limit
        );
        debug!(base_url = %self.base_url, limit = self.limit, "Fetching flights");

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: Result<FlightsResponse, _> = serde_json::from_str(&body);
        if !status.is_success() {
            let message = parsed
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or(body);
            return Err(EtlError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let parsed = parsed.map_err(|e| EtlError::ParseError(e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(EtlError::ApiError {
                code: status.as_u16(),
                message: format!(
                    "{}: {}",
                    error.code.unwrap_or_else(|| "error".to_string()),
                    error.message.unwrap_or_default()
                ),
            });
        }

        let flights = parsed.data.unwrap_or_default();
        info!(source = "aviationstack", rows = flights.len(), "Extracted flights");
        Ok(flights)
    }
}

/// Reads flights from a JSON file, either an array of flights or an API
/// response with a `data` array.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FlightSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self) -> Result<Vec<RawFlight>, EtlError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let data = match value {
            serde_json::Value::Object(mut map) => map.remove("data").unwrap_or_default(),
            other => other,
        };
        let flights: Vec<RawFlight> =
            serde_json::from_value(data).map_err(|e| EtlError::ParseError(e.to_string()))?;
        info!(source = %self.path.display(), rows = flights.len(), "Extracted flights");
        Ok(flights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    const RESPONSE: &str = r#"{
        "pagination": {"limit": 100, "offset": 0, "count": 1, "total": 1},
        "data": [{
            "flight_date": "2024-03-01",
            "flight_status": "active",
            "departure": {"airport": "San Francisco International", "timezone": "America/Los_Angeles", "iata": "SFO", "terminal": "2"},
            "arrival": {"airport": "Dallas/Fort Worth International", "timezone": "America/Chicago", "iata": "DFW", "terminal": "A/B"},
            "airline": {"name": "American Airlines", "iata": "AA"},
            "flight": {"number": "1004", "iata": "AA1004"}
        }]
    }"#;

    #[test]
    fn test_missing_api_key() {
        assert!(matches!(
            AviationStackClient::new("http://localhost", "  "),
            Err(EtlError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn test_fetch_flights() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/flights")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("access_key".into(), "k3y".into()),
                Matcher::UrlEncoded("limit".into(), "10".into()),
            ]))
            .with_status(200)
            .with_body(RESPONSE)
            .create_async()
            .await;

        let client = AviationStackClient::new(format!("{}/v1", server.url()), "k3y")
            .unwrap()
            .with_limit(10);
        let flights = client.fetch().await.unwrap();

        assert_eq!(flights.len(), 1);
        assert_eq!(flights[0].flight.as_ref().unwrap().number.as_deref(), Some("1004"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_in_body() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/flights")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error": {"code": "invalid_access_key", "message": "You have not supplied a valid API Access Key."}}"#)
            .create_async()
            .await;

        let client = AviationStackClient::new(format!("{}/v1", server.url()), "bad").unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(err.to_string().contains("invalid_access_key"));
    }

    #[tokio::test]
    async fn test_file_source_accepts_api_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flights.json");
        std::fs::write(&path, RESPONSE).unwrap();

        let flights = FileSource::new(&path).fetch().await.unwrap();
        assert_eq!(flights.len(), 1);
        assert_eq!(flights[0].flight_status.as_deref(), Some("active"));
    }
}
