use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geo_types::Point;
use kiddo::{SquaredEuclidean, float::kdtree};
use serde_json::Value;

use crate::{
    codec,
    history::HistoryQuery,
    model::Station,
    stations::station_key,
    store::{
        GeoIndex, GeoMember, KeyValueStore, QueryResponse, Series, StatementResult, StoreError,
        TimeSeriesStore,
    },
};

/// A store call as seen by [`MemoryStore`].
#[derive(Clone, Debug, PartialEq)]
pub enum StoreCall {
    BulkGet(Vec<String>),
    ListKeys(String),
    GeoRadius { index_key: String, radius_km: f64 },
    Query { database: String, command: String },
}

/// In-process stand-in for both backing stores. Keys are listed in sorted
/// order, geo lookups use great-circle distances, and time-series queries
/// understand the window queries built by [`HistoryQuery`].
#[derive(Default)]
pub struct MemoryStore {
    values: BTreeMap<String, Vec<u8>>,
    geo: HashMap<String, GeoSet>,
    measurements: HashMap<String, Vec<Vec<Value>>>,
    calls: Mutex<Vec<StoreCall>>,
    offline: AtomicBool,
}

struct GeoSet {
    tree: kdtree::KdTree<f64, usize, 3, 32, u32>,
    names: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.values.insert(key.into(), value.into());
    }

    /// Stores a station under its `{contract}_{number}` key.
    pub fn insert_station(&mut self, station: &Station) -> Result<(), serde_json::Error> {
        let key = station_key(&station.contract_name, &station.number.to_string());
        self.insert(key, codec::encode_station(station)?);
        Ok(())
    }

    /// Adds a member to a geo index. `position` is (lng, lat).
    pub fn geo_add(&mut self, index_key: &str, name: impl Into<String>, position: Point<f64>) {
        let set = self.geo.entry(index_key.to_owned()).or_insert_with(|| GeoSet {
            tree: kdtree::KdTree::new(),
            names: Vec::new(),
        });
        set.tree.add(&unit_vector(position), set.names.len());
        set.names.push(name.into());
    }

    /// Appends `[time, available_bike_stands, available_bikes]` rows to a
    /// measurement. Times are RFC 3339 strings.
    pub fn insert_rows(&mut self, measurement: &str, rows: Vec<Vec<Value>>) {
        self.measurements
            .entry(measurement.to_owned())
            .or_default()
            .extend(rows);
    }

    /// Makes every subsequent call fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: StoreCall) -> Result<(), StoreError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);

        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.record(StoreCall::BulkGet(keys.to_vec()))?;
        Ok(keys.iter().map(|k| self.values.get(k).cloned()).collect())
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.record(StoreCall::ListKeys(pattern.to_owned()))?;
        let mut keys: Vec<String> = self
            .values
            .keys()
            .chain(self.geo.keys())
            .filter(|k| glob_matches(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl GeoIndex for MemoryStore {
    async fn geo_radius(
        &self,
        index_key: &str,
        lng: f64,
        lat: f64,
        radius_km: f64,
        ascending: bool,
    ) -> Result<Vec<GeoMember>, StoreError> {
        self.record(StoreCall::GeoRadius {
            index_key: index_key.to_owned(),
            radius_km,
        })?;

        let Some(set) = self.geo.get(index_key) else {
            return Ok(vec![]);
        };

        let center = unit_vector(Point::new(lng, lat));
        let mut members: Vec<GeoMember> = set
            .tree
            .within::<SquaredEuclidean>(&center, squared_chord(radius_km))
            .into_iter()
            .map(|n| GeoMember {
                name: set.names[n.item].clone(),
                distance_km: surface_km(n.distance),
            })
            .collect();

        members.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        if !ascending {
            members.reverse();
        }
        Ok(members)
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn query(&self, database: &str, command: &str) -> Result<QueryResponse, StoreError> {
        self.record(StoreCall::Query {
            database: database.to_owned(),
            command: command.to_owned(),
        })?;

        let query: HistoryQuery = command
            .parse()
            .map_err(|e: anyhow::Error| StoreError::Query(format!("{e:#}")))?;

        let rows: Vec<Vec<Value>> = self
            .measurements
            .get(&query.measurement)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_time(row).is_some_and(|t| query.contains(t)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // InfluxDB answers an empty selection with a statement that has no series.
        let series = if rows.is_empty() {
            vec![]
        } else {
            vec![Series {
                name: query.measurement.clone(),
                columns: vec![
                    "time".to_owned(),
                    "available_bike_stands".to_owned(),
                    "available_bikes".to_owned(),
                ],
                values: rows,
            }]
        };

        Ok(QueryResponse {
            results: vec![StatementResult {
                statement_id: 0,
                series,
                error: None,
            }],
            error: None,
        })
    }
}

fn row_time(row: &[Value]) -> Option<DateTime<Utc>> {
    let time = row.first()?.as_str()?;
    DateTime::parse_from_rfc3339(time)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Redis-style glob matching for `*` and `?`.
fn glob_matches(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, _) => text.is_empty(),
        (Some((b'*', rest)), _) => {
            glob_matches(rest, text) || (!text.is_empty() && glob_matches(pattern, &text[1..]))
        }
        (Some((b'?', rest)), Some((_, tail))) => glob_matches(rest, tail),
        (Some((p, rest)), Some((c, tail))) if p == c => glob_matches(rest, tail),
        _ => false,
    }
}

const EARTH_RADIUS_KM: f64 = 6_371.0088;

/// Position on the unit sphere, so great-circle order matches Euclidean order.
fn unit_vector(position: Point<f64>) -> [f64; 3] {
    let (lat, lng) = (position.y().to_radians(), position.x().to_radians());
    [lat.cos() * lng.cos(), lat.cos() * lng.sin(), lat.sin()]
}

/// Squared chord between two points `km` apart along the surface.
fn squared_chord(km: f64) -> f64 {
    (2.0 * (km / (2.0 * EARTH_RADIUS_KM)).sin()).powi(2)
}

fn surface_km(squared_chord: f64) -> f64 {
    2.0 * EARTH_RADIUS_KM * (squared_chord.sqrt() / 2.0).asin()
}
