use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Image {
    pub uid: i64,
    pub width: i64,
    pub quality: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Position {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lng")]
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Snapshot of one docking station as stored in the cache.
///
/// Every field falls back to its zero value when missing from the payload, so
/// partially populated cache entries still decode.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Station {
    pub number: i64,
    pub name: String,
    pub address: String,
    pub position: Position,
    pub banking: bool,
    pub bonus: bool,
    pub status: String,
    pub contract_name: String,
    pub bike_stands: i64,
    pub available_bike_stands: i64,
    pub available_bikes: i64,
    pub last_update: String,
    pub images: Vec<Image>,
}

/// One historical availability sample.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StationBikeState {
    pub time: String,
    pub available_bike_stands: i64,
    pub available_bikes: i64,
}
