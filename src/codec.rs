use serde_json::Value;
use thiserror::Error;

use crate::model::{Station, StationBikeState};

#[derive(Debug, Error)]
#[error("malformed station payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

pub fn decode_station(raw: &[u8]) -> Result<Station, DecodeError> {
    Ok(serde_json::from_slice(raw)?)
}

/// Decodes a cached station, falling back to the zero-valued station when the
/// payload is not valid.
pub fn decode_station_lenient(raw: &[u8]) -> Station {
    decode_station(raw).unwrap_or_default()
}

pub fn encode_station(station: &Station) -> Result<String, serde_json::Error> {
    serde_json::to_string(station)
}

/// Maps `[time, available_bike_stands, available_bikes]` rows to samples,
/// keeping input order. Values that are not integers become 0.
pub fn decode_samples(rows: &[Vec<Value>]) -> Vec<StationBikeState> {
    rows.iter()
        .map(|row| StationBikeState {
            time: row.first().map(timestamp_token).unwrap_or_default(),
            available_bike_stands: row.get(1).map(integer_or_zero).unwrap_or(0),
            available_bikes: row.get(2).map(integer_or_zero).unwrap_or(0),
        })
        .collect()
}

fn timestamp_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn integer_or_zero(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
