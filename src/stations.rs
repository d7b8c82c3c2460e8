//! Resolves station snapshots from the cache by number, by distance from a
//! point, or for a whole contract.

use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    codec::{self, DecodeError},
    model::Station,
    store::{GeoIndex, KeyValueStore, StoreError},
};

/// Radius of every geo lookup. The caller's distance is not applied.
pub const GEO_SEARCH_RADIUS_KM: f64 = 100.0;

pub fn station_key(contract_name: &str, number: &str) -> String {
    format!("{contract_name}_{number}")
}

fn images_key(contract_name: &str) -> String {
    format!("{contract_name}_images")
}

fn geo_index_key(contract_name: &str) -> String {
    format!("{contract_name}_stations")
}

/// What to do with a cached value that does not decode as a station.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DecodePolicy {
    /// Return a zero-valued station in its place.
    #[default]
    Lenient,
    /// Leave it out of the result.
    Skip,
    /// Fail the whole lookup.
    Strict,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("station cache request failed")]
    Store(#[from] StoreError),
    #[error("cached station {key} could not be decoded")]
    Decode {
        key: String,
        #[source]
        source: DecodeError,
    },
}

/// The lookup strategy for one `/stations` request.
#[derive(Clone, Debug, PartialEq)]
pub enum StationQuery {
    ByNumbers {
        contract_name: String,
        numbers: Vec<String>,
    },
    Nearby {
        contract_name: String,
        lat: f64,
        lng: f64,
        radius_m: f64,
    },
    ByContract {
        contract_name: String,
    },
}

impl StationQuery {
    /// Numbers win over coordinates, coordinates over the whole contract. A
    /// zero latitude or longitude counts as not supplied.
    pub fn from_params(
        contract_name: String,
        numbers: Vec<String>,
        lat: f64,
        lng: f64,
        radius_m: f64,
    ) -> Self {
        let numbers: Vec<String> = numbers.into_iter().filter(|n| !n.is_empty()).collect();

        if !numbers.is_empty() {
            StationQuery::ByNumbers {
                contract_name,
                numbers,
            }
        } else if lat != 0.0 && lng != 0.0 {
            StationQuery::Nearby {
                contract_name,
                lat,
                lng,
                radius_m,
            }
        } else {
            StationQuery::ByContract { contract_name }
        }
    }
}

pub struct StationResolver {
    kv: Arc<dyn KeyValueStore>,
    geo: Arc<dyn GeoIndex>,
    policy: DecodePolicy,
}

impl StationResolver {
    pub fn new(kv: Arc<dyn KeyValueStore>, geo: Arc<dyn GeoIndex>, policy: DecodePolicy) -> Self {
        Self { kv, geo, policy }
    }

    pub async fn resolve_stations(
        &self,
        contract_name: &str,
        numbers: Vec<String>,
        lat: f64,
        lng: f64,
        radius_m: f64,
    ) -> Result<Vec<Station>, ResolveError> {
        let query = StationQuery::from_params(contract_name.to_owned(), numbers, lat, lng, radius_m);
        self.resolve(&query).await
    }

    pub async fn resolve(&self, query: &StationQuery) -> Result<Vec<Station>, ResolveError> {
        match query {
            StationQuery::ByNumbers {
                contract_name,
                numbers,
            } => {
                info!(contract = %contract_name, ?numbers, "station search by numbers");
                self.resolve_by_numbers(contract_name, numbers).await
            }
            StationQuery::Nearby {
                contract_name,
                lat,
                lng,
                radius_m,
            } => {
                info!(contract = %contract_name, lat, lng, radius_m, "station search nearby");
                self.resolve_by_geo_radius(contract_name, *lat, *lng, *radius_m)
                    .await
            }
            StationQuery::ByContract { contract_name } => {
                info!(contract = %contract_name, "station search by contract");
                self.resolve_by_contract(contract_name).await
            }
        }
    }

    pub async fn resolve_by_numbers(
        &self,
        contract_name: &str,
        numbers: &[String],
    ) -> Result<Vec<Station>, ResolveError> {
        if numbers.is_empty() {
            return Ok(vec![]);
        }

        let keys = numbers
            .iter()
            .map(|n| station_key(contract_name, n))
            .collect_vec();
        self.fetch(contract_name, keys).await
    }

    /// Stations around (lat, lng), nearest first. `radius_m` is accepted for
    /// API compatibility; the lookup always uses [`GEO_SEARCH_RADIUS_KM`].
    pub async fn resolve_by_geo_radius(
        &self,
        contract_name: &str,
        lat: f64,
        lng: f64,
        radius_m: f64,
    ) -> Result<Vec<Station>, ResolveError> {
        debug!(
            radius_m,
            applied_km = GEO_SEARCH_RADIUS_KM,
            "requested radius is not applied"
        );

        let members = self
            .geo
            .geo_radius(
                &geo_index_key(contract_name),
                lng,
                lat,
                GEO_SEARCH_RADIUS_KM,
                true,
            )
            .await?;

        let keys = members
            .iter()
            .map(|m| station_key(contract_name, &m.name))
            .collect_vec();
        self.fetch(contract_name, keys).await
    }

    pub async fn resolve_by_contract(
        &self,
        contract_name: &str,
    ) -> Result<Vec<Station>, ResolveError> {
        let keys = self.kv.list_keys(&station_key(contract_name, "*")).await?;
        self.fetch(contract_name, keys).await
    }

    /// Bulk-gets `keys` minus the reserved images key, drops absent entries
    /// and decodes the rest in key order.
    async fn fetch(
        &self,
        contract_name: &str,
        keys: Vec<String>,
    ) -> Result<Vec<Station>, ResolveError> {
        let images = images_key(contract_name);
        let keys = keys.into_iter().filter(|k| *k != images).collect_vec();
        debug!(keys = %keys.iter().join(","), "fetching stations");

        if keys.is_empty() {
            return Ok(vec![]);
        }

        let values = self.kv.bulk_get(&keys).await?;
        if values.len() != keys.len() {
            return Err(StoreError::Protocol(format!(
                "asked for {} keys, got {} values",
                keys.len(),
                values.len()
            ))
            .into());
        }

        let mut stations = Vec::with_capacity(values.len());
        for (key, value) in keys.into_iter().zip(values) {
            let Some(raw) = value else {
                debug!(%key, "no cached station");
                continue;
            };

            match codec::decode_station(&raw) {
                Ok(station) => stations.push(station),
                Err(source) => match self.policy {
                    DecodePolicy::Lenient => {
                        warn!(%key, error = %source, "undecodable station, using zero value");
                        stations.push(Station::default());
                    }
                    DecodePolicy::Skip => {
                        warn!(%key, error = %source, "undecodable station, skipping");
                    }
                    DecodePolicy::Strict => return Err(ResolveError::Decode { key, source }),
                },
            }
        }

        Ok(stations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::Position, store::{MemoryStore, StoreCall}};
    use geo_types::Point;

    fn station(contract_name: &str, number: i64, lat: f64, lng: f64) -> Station {
        Station {
            number,
            name: format!("Station {number}"),
            position: Position::new(lat, lng),
            status: "OPEN".to_owned(),
            contract_name: contract_name.to_owned(),
            bike_stands: 20,
            available_bike_stands: 5,
            available_bikes: 15,
            ..Default::default()
        }
    }

    fn numbers(ns: &[&str]) -> Vec<String> {
        ns.iter().map(|n| n.to_string()).collect()
    }

    fn resolver(store: MemoryStore, policy: DecodePolicy) -> (Arc<MemoryStore>, StationResolver) {
        let store = Arc::new(store);
        let resolver = StationResolver::new(store.clone(), store.clone(), policy);
        (store, resolver)
    }

    fn paris() -> MemoryStore {
        let mut store = MemoryStore::new();
        for (number, lat, lng) in [(1, 48.8532, 2.3690), (2, 48.8589, 2.3470), (3, 48.8867, 2.3431)] {
            let s = station("Paris", number, lat, lng);
            store.insert_station(&s).unwrap();
            store.geo_add("Paris_stations", number.to_string(), Point::new(lng, lat));
        }
        store.insert("Paris_images", r#"[{"uid":1}]"#);
        store.insert_station(&station("Lyon", 1, 45.7605, 4.8590)).unwrap();
        store
    }

    #[tokio::test]
    async fn numbers_skip_missing_stations() {
        let mut store = MemoryStore::new();
        store.insert_station(&station("Paris", 1, 48.85, 2.35)).unwrap();
        let (_, resolver) = resolver(store, DecodePolicy::Lenient);

        let stations = resolver
            .resolve_by_numbers("Paris", &numbers(&["1", "2"]))
            .await
            .unwrap();
        assert_eq!(stations, vec![station("Paris", 1, 48.85, 2.35)]);
    }

    #[tokio::test]
    async fn numbers_never_return_the_images_entry() {
        let (store, resolver) = resolver(paris(), DecodePolicy::Lenient);
        let requested = numbers(&["3", "images", "1", "99"]);

        let stations = resolver.resolve_by_numbers("Paris", &requested).await.unwrap();
        let got: Vec<i64> = stations.iter().map(|s| s.number).collect();
        assert_eq!(got, vec![3, 1]);
        assert!(stations.len() <= requested.len());
        assert_eq!(
            store.calls(),
            vec![StoreCall::BulkGet(numbers(&["Paris_3", "Paris_1", "Paris_99"]))]
        );
    }

    #[tokio::test]
    async fn no_numbers_means_no_store_call() {
        let (store, resolver) = resolver(paris(), DecodePolicy::Lenient);
        let stations = resolver.resolve_by_numbers("Paris", &[]).await.unwrap();
        assert!(stations.is_empty());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn contract_lists_only_its_own_stations() {
        let (store, resolver) = resolver(paris(), DecodePolicy::Lenient);

        let stations = resolver.resolve_by_contract("Paris").await.unwrap();
        let got: Vec<i64> = stations.iter().map(|s| s.number).collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(stations.iter().all(|s| s.contract_name == "Paris"));

        // The geo index key is listed too but holds no plain value.
        assert_eq!(
            store.calls(),
            vec![
                StoreCall::ListKeys("Paris_*".to_owned()),
                StoreCall::BulkGet(numbers(&["Paris_1", "Paris_2", "Paris_3", "Paris_stations"])),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_contract_is_empty() {
        let (store, resolver) = resolver(paris(), DecodePolicy::Lenient);
        assert!(resolver.resolve_by_contract("Nantes").await.unwrap().is_empty());
        assert_eq!(store.calls(), vec![StoreCall::ListKeys("Nantes_*".to_owned())]);
    }

    #[tokio::test]
    async fn nearby_follows_geo_order_with_fixed_radius() {
        let (store, resolver) = resolver(paris(), DecodePolicy::Lenient);

        // Next to station 3 (Montmartre); 1 and 2 are further south.
        let stations = resolver
            .resolve_by_geo_radius("Paris", 48.8860, 2.3430, 50.0)
            .await
            .unwrap();
        let got: Vec<i64> = stations.iter().map(|s| s.number).collect();
        assert_eq!(got, vec![3, 2, 1]);

        assert_eq!(
            store.calls()[0],
            StoreCall::GeoRadius {
                index_key: "Paris_stations".to_owned(),
                radius_km: GEO_SEARCH_RADIUS_KM,
            }
        );
    }

    #[tokio::test]
    async fn nearby_outside_radius_is_empty() {
        let (store, resolver) = resolver(paris(), DecodePolicy::Lenient);
        let stations = resolver
            .resolve_by_geo_radius("Paris", 43.2965, 5.3698, 5000.0)
            .await
            .unwrap();
        assert!(stations.is_empty());
        assert_eq!(store.calls().len(), 1);
    }

    #[test]
    fn dispatch_prefers_numbers_then_coordinates() {
        let q = StationQuery::from_params("Paris".into(), numbers(&["", "4"]), 48.0, 2.0, 10.0);
        assert_eq!(
            q,
            StationQuery::ByNumbers {
                contract_name: "Paris".into(),
                numbers: numbers(&["4"]),
            }
        );

        let q = StationQuery::from_params("Paris".into(), numbers(&[""]), 48.0, 2.0, 10.0);
        assert!(matches!(q, StationQuery::Nearby { radius_m, .. } if radius_m == 10.0));

        let q = StationQuery::from_params("Paris".into(), vec![], 0.0, 2.0, 10.0);
        assert_eq!(
            q,
            StationQuery::ByContract {
                contract_name: "Paris".into()
            }
        );
    }

    fn with_garbage() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.insert_station(&station("Paris", 1, 48.85, 2.35)).unwrap();
        store.insert("Paris_2", "{oops");
        store
    }

    #[tokio::test]
    async fn lenient_policy_substitutes_zero_value() {
        let (_, resolver) = resolver(with_garbage(), DecodePolicy::Lenient);
        let stations = resolver.resolve_by_contract("Paris").await.unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[1], Station::default());
    }

    #[tokio::test]
    async fn skip_policy_drops_bad_entries() {
        let (_, resolver) = resolver(with_garbage(), DecodePolicy::Skip);
        let stations = resolver.resolve_by_contract("Paris").await.unwrap();
        assert_eq!(stations, vec![station("Paris", 1, 48.85, 2.35)]);
    }

    #[tokio::test]
    async fn strict_policy_fails_on_bad_entries() {
        let (_, resolver) = resolver(with_garbage(), DecodePolicy::Strict);
        let err = resolver.resolve_by_contract("Paris").await.unwrap_err();
        assert!(matches!(err, ResolveError::Decode { ref key, .. } if key == "Paris_2"));
    }

    #[tokio::test]
    async fn unreachable_cache_is_an_error_not_an_empty_list() {
        let (store, resolver) = resolver(paris(), DecodePolicy::Lenient);
        store.set_offline(true);
        let err = resolver
            .resolve_stations("Paris", numbers(&["1"]), 0.0, 0.0, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Store(StoreError::Unavailable(_))));
    }
}
