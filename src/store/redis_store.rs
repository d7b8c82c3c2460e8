use async_trait::async_trait;
use redis::{Client, RedisError, aio::ConnectionManager};

use crate::store::{GeoIndex, GeoMember, KeyValueStore, StoreError};

/// Station cache backed by Redis. The connection manager multiplexes every
/// request over one connection and reconnects on its own.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }
}

#[async_trait]
impl GeoIndex for RedisStore {
    async fn geo_radius(
        &self,
        index_key: &str,
        lng: f64,
        lat: f64,
        radius_km: f64,
        ascending: bool,
    ) -> Result<Vec<GeoMember>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<(String, f64)> = redis::cmd("GEORADIUS")
            .arg(index_key)
            .arg(lng)
            .arg(lat)
            .arg(radius_km)
            .arg("km")
            .arg("WITHDIST")
            .arg(if ascending { "ASC" } else { "DESC" })
            .query_async(&mut conn)
            .await?;

        Ok(members
            .into_iter()
            .map(|(name, distance_km)| GeoMember { name, distance_km })
            .collect())
    }
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Query(e.to_string())
        }
    }
}
