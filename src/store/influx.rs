use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::store::{QueryResponse, StoreError, TimeSeriesStore};

/// InfluxDB 1.x client speaking the HTTP `/query` endpoint.
pub struct InfluxStore {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl InfluxStore {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("could not build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn query(&self, database: &str, command: &str) -> Result<QueryResponse, StoreError> {
        let url = format!("{}/query", self.base_url);
        debug!(%url, database, command, "sending influx query");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("db", database), ("q", command)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(StoreError::Query(format!("{status}: {body}")));
        }

        let parsed: QueryResponse =
            serde_json::from_str(&body).map_err(|e| StoreError::Protocol(e.to_string()))?;
        if let Some(error) = parsed.first_error() {
            return Err(StoreError::Query(error.to_owned()));
        }

        Ok(parsed)
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            StoreError::Protocol(e.to_string())
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }
}
