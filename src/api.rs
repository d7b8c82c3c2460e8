use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    history::{HistoryError, HistoryService, SamplingInterval},
    model::{Station, StationBikeState},
    stations::{ResolveError, StationQuery, StationResolver},
};

const DATE_FORMAT: &str = "%Y%m%d-%H%M";

/// Values applied when a request leaves a parameter out.
#[derive(Clone, Debug)]
pub struct RequestDefaults {
    pub contract_name: String,
    pub distance_m: f64,
    pub sampling_interval: SamplingInterval,
}

#[derive(Clone)]
pub struct AppState {
    pub stations: Arc<StationResolver>,
    pub history: Arc<HistoryService>,
    pub defaults: Arc<RequestDefaults>,
}

impl AppState {
    pub fn new(stations: StationResolver, history: HistoryService, defaults: RequestDefaults) -> Self {
        Self {
            stations: Arc::new(stations),
            history: Arc::new(history),
            defaults: Arc::new(defaults),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stations", get(list_stations))
        .route(
            "/stations/{contract_name}/{station_number}/{date}/availability-infos",
            get(availability_infos),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid date {0:?}, expected YYYYMMDD-HHMM")]
    InvalidDate(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidDate(_) => StatusCode::BAD_REQUEST,
            ApiError::Resolve(_) | ApiError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match std::error::Error::source(&self) {
            Some(source) => format!("{self}: {source}"),
            None => self.to_string(),
        };
        if status.is_server_error() {
            error!(error = %message, "request failed");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Raw `/stations` query string. Numeric values that do not parse count as
/// absent.
#[derive(Debug, Default, Deserialize)]
pub struct StationsParams {
    #[serde(rename = "contract-name")]
    pub contract_name: Option<String>,
    pub numbers: Option<String>,
    pub lat: Option<String>,
    pub lng: Option<String>,
    pub distance: Option<String>,
}

impl StationsParams {
    fn into_query(self, defaults: &RequestDefaults) -> StationQuery {
        let contract_name = self
            .contract_name
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| defaults.contract_name.clone());
        let numbers = self
            .numbers
            .map(|n| n.split(',').map(|s| s.trim().to_owned()).collect())
            .unwrap_or_default();

        StationQuery::from_params(
            contract_name,
            numbers,
            parse_or(self.lat.as_deref(), 0.0),
            parse_or(self.lng.as_deref(), 0.0),
            parse_or(self.distance.as_deref(), defaults.distance_m),
        )
    }
}

fn parse_or(value: Option<&str>, default: f64) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

async fn list_stations(
    State(state): State<AppState>,
    Query(params): Query<StationsParams>,
) -> Result<Json<Vec<Station>>, ApiError> {
    let query = params.into_query(&state.defaults);
    let stations = state.stations.resolve(&query).await?;
    Ok(Json(stations))
}

async fn availability_infos(
    State(state): State<AppState>,
    Path((contract_name, station_number, date)): Path<(String, String, String)>,
) -> Result<Json<Vec<StationBikeState>>, ApiError> {
    let contract_name = if contract_name.is_empty() {
        state.defaults.contract_name.clone()
    } else {
        contract_name
    };
    let date = NaiveDateTime::parse_from_str(&date, DATE_FORMAT)
        .map_err(|_| ApiError::InvalidDate(date.clone()))?;

    info!(contract = %contract_name, station = %station_number, %date, "availability history");
    let samples = state
        .history
        .fetch_history(
            &contract_name,
            &station_number,
            date,
            state.defaults.sampling_interval,
        )
        .await?;
    Ok(Json(samples))
}
