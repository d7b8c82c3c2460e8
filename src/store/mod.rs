//! Contracts for the two backing stores, with Redis, InfluxDB and in-memory
//! implementations.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

mod influx;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod redis_store;

pub use influx::InfluxStore;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryStore, StoreCall};
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected the request: {0}")]
    Query(String),
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeoMember {
    pub name: String,
    pub distance_km: f64,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetches all keys in one round trip. The result is positional: one
    /// entry per key, `None` where the key holds no value.
    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    /// Lists keys matching a glob pattern (`*`, `?`).
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait GeoIndex: Send + Sync {
    async fn geo_radius(
        &self,
        index_key: &str,
        lng: f64,
        lat: f64,
        radius_km: f64,
        ascending: bool,
    ) -> Result<Vec<GeoMember>, StoreError>;
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Runs a query. Store-side failures, including per-statement errors, are
    /// returned as `Err`; an empty answer is an `Ok` with no series.
    async fn query(&self, database: &str, command: &str) -> Result<QueryResponse, StoreError>;
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<StatementResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueryResponse {
    pub fn first_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.results.iter().find_map(|r| r.error.as_deref()))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub statement_id: u32,
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}
