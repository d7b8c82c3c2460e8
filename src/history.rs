use std::{fmt, num::NonZeroUsize, str::FromStr, sync::Arc};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    codec,
    model::StationBikeState,
    store::{StoreError, TimeSeriesStore},
};

const WINDOW_HOURS: i64 = 24;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Keep every Nth sample. With one-minute source data, 60 yields hourly output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingInterval(NonZeroUsize);

impl SamplingInterval {
    pub const HOURLY: Self = Self(NonZeroUsize::MIN.saturating_add(59));

    pub fn new(every: usize) -> Option<Self> {
        NonZeroUsize::new(every).map(Self)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for SamplingInterval {
    fn default() -> Self {
        Self::HOURLY
    }
}

impl FromStr for SamplingInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let every: usize = s
            .parse()
            .map_err(|_| format!("invalid sampling interval: {s}"))?;
        Self::new(every).ok_or_else(|| "sampling interval must be at least 1".to_owned())
    }
}

impl fmt::Display for SamplingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A one-day window over a single station's measurement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryQuery {
    pub measurement: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HistoryQuery {
    /// The window `[anchor, anchor + 24h)` with the anchor truncated to the
    /// minute.
    pub fn for_day(contract_name: &str, station_number: &str, anchor: NaiveDateTime) -> Self {
        let start = floor_to_minute(anchor).and_utc();
        Self {
            measurement: format!("{contract_name}_{station_number}"),
            start,
            end: start + TimeDelta::hours(WINDOW_HOURS),
        }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }
}

fn floor_to_minute(anchor: NaiveDateTime) -> NaiveDateTime {
    let time = NaiveTime::from_hms_opt(anchor.hour(), anchor.minute(), 0).unwrap_or_default();
    anchor.date().and_time(time)
}

impl fmt::Display for HistoryQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELECT * FROM \"{}\" WHERE time >= '{}' AND time < '{}'",
            escape_identifier(&self.measurement),
            self.start.format(TIMESTAMP_FORMAT),
            self.end.format(TIMESTAMP_FORMAT),
        )
    }
}

impl FromStr for HistoryQuery {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("SELECT * FROM \"")
            .with_context(|| format!("not a station history query: {s}"))?;
        let (measurement, rest) = split_identifier(rest)?;
        let rest = rest
            .strip_prefix(" WHERE time >= '")
            .with_context(|| format!("missing lower time bound in {s}"))?;
        let (start, rest) = rest
            .split_once("' AND time < '")
            .with_context(|| format!("missing upper time bound in {s}"))?;
        let end = rest
            .strip_suffix('\'')
            .with_context(|| format!("unterminated upper time bound in {s}"))?;

        Ok(HistoryQuery {
            measurement,
            start: parse_timestamp(start)?,
            end: parse_timestamp(end)?,
        })
    }
}

/// Escapes a double-quoted InfluxQL identifier body.
fn escape_identifier(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Reads an escaped identifier body up to its closing quote and returns it
/// with the text that follows the quote.
fn split_identifier(s: &str) -> Result<(String, &str)> {
    let mut name = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .with_context(|| format!("dangling escape in identifier: {s}"))?;
                name.push(escaped);
            }
            '"' => return Ok((name, &s[i + 1..])),
            c => name.push(c),
        }
    }
    bail!("unterminated identifier: {s}")
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map(|t| t.and_utc())
        .with_context(|| format!("bad timestamp (RFC 3339, UTC): {s}"))
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("time-series query on {measurement} failed")]
    Store {
        measurement: String,
        #[source]
        source: StoreError,
    },
}

/// Reads one station's availability history from the time-series store.
pub struct HistoryService {
    store: Arc<dyn TimeSeriesStore>,
    database: String,
}

impl HistoryService {
    pub fn new(store: Arc<dyn TimeSeriesStore>, database: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
        }
    }

    pub async fn fetch_history(
        &self,
        contract_name: &str,
        station_number: &str,
        date: NaiveDateTime,
        interval: SamplingInterval,
    ) -> Result<Vec<StationBikeState>, HistoryError> {
        let query = HistoryQuery::for_day(contract_name, station_number, date);
        let command = query.to_string();
        debug!(%command, database = %self.database, "querying station history");

        let response = self
            .store
            .query(&self.database, &command)
            .await
            .map_err(|source| {
                error!(measurement = %query.measurement, error = %source, "history query failed");
                HistoryError::Store {
                    measurement: query.measurement.clone(),
                    source,
                }
            })?;

        let Some(result) = response.results.first() else {
            debug!("history query returned no result set");
            return Ok(vec![]);
        };
        let Some(series) = result.series.first() else {
            debug!("history query returned no series");
            return Ok(vec![]);
        };
        if series.values.is_empty() {
            debug!(series = %series.name, "history series has no rows");
            return Ok(vec![]);
        }

        let samples = codec::decode_samples(&series.values);
        debug!(rows = samples.len(), every = %interval, "downsampling history");
        Ok(downsample(samples, interval))
    }
}

/// Keeps the items at positions `0, k, 2k, ...`.
pub fn downsample<T>(items: Vec<T>, interval: SamplingInterval) -> Vec<T> {
    items.into_iter().step_by(interval.get()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, QueryResponse, Series, StatementResult, StoreCall};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::{Value, json};

    fn anchor(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn minute_rows(start: DateTime<Utc>, count: i64) -> Vec<Vec<Value>> {
        (0..count)
            .map(|i| {
                let t = start + TimeDelta::minutes(i);
                vec![
                    json!(t.format(TIMESTAMP_FORMAT).to_string()),
                    json!(i % 20),
                    json!(20 - i % 20),
                ]
            })
            .collect()
    }

    #[test]
    fn window_is_minute_aligned_and_one_day_long() {
        let query = HistoryQuery::for_day("Paris", "1", anchor(8, 30, 45));
        assert_eq!(query.measurement, "Paris_1");
        assert_eq!(query.start, anchor(8, 30, 0).and_utc());
        assert_eq!(query.end - query.start, TimeDelta::hours(24));
        assert!(query.contains(query.start));
        assert!(!query.contains(query.end));
    }

    #[test]
    fn query_text_parses_back() {
        let query = HistoryQuery::for_day("Paris", "901", anchor(0, 0, 0));
        let text = query.to_string();
        assert_eq!(
            text,
            "SELECT * FROM \"Paris_901\" WHERE time >= '2020-01-01T00:00:00Z' AND time < '2020-01-02T00:00:00Z'"
        );
        assert_eq!(text.parse::<HistoryQuery>().unwrap(), query);
        assert!("SELECT * FROM cpu".parse::<HistoryQuery>().is_err());
    }

    #[test]
    fn station_numbers_cannot_break_out_of_the_identifier() {
        let query = HistoryQuery::for_day("Paris", "1\\", anchor(0, 0, 0));
        let text = query.to_string();
        assert!(text.starts_with("SELECT * FROM \"Paris_1\\\\\" WHERE time >= '"));
        assert_eq!(text.parse::<HistoryQuery>().unwrap(), query);

        let query = HistoryQuery::for_day("Paris", "1\\\" , \"Lyon_2", anchor(0, 0, 0));
        let text = query.to_string();
        let body = text.strip_prefix("SELECT * FROM \"").unwrap();
        let (name, rest) = split_identifier(body).unwrap();
        assert_eq!(name, "Paris_1\\\" , \"Lyon_2");
        assert!(rest.starts_with(" WHERE time >= '"));
        assert_eq!(text.parse::<HistoryQuery>().unwrap(), query);
    }

    #[test]
    fn unterminated_identifiers_are_rejected() {
        assert!(split_identifier("Paris_1\\\" WHERE").is_err());
        assert!(split_identifier("Paris_1\\").is_err());
    }

    #[test]
    fn downsample_keeps_ceil_n_over_k_in_order() {
        for n in 0..25usize {
            for k in 1..7usize {
                let items: Vec<usize> = (0..n).collect();
                let kept = downsample(items, SamplingInterval::new(k).unwrap());
                assert_eq!(kept.len(), n.div_ceil(k), "n={n} k={k}");
                assert!(kept.iter().all(|i| i % k == 0));
                assert!(kept.windows(2).all(|w| w[0] < w[1]));
                if n > 0 {
                    assert_eq!(kept[0], 0);
                }
            }
        }
    }

    #[test]
    fn interval_must_be_positive() {
        assert!(SamplingInterval::new(0).is_none());
        assert!("0".parse::<SamplingInterval>().is_err());
        assert!("abc".parse::<SamplingInterval>().is_err());
        assert_eq!("15".parse::<SamplingInterval>().unwrap().get(), 15);
        assert_eq!(SamplingInterval::default().get(), 60);
    }

    #[tokio::test]
    async fn hourly_sampling_of_three_hours() {
        let mut store = MemoryStore::new();
        store.insert_rows("Paris_1", minute_rows(anchor(0, 0, 0).and_utc(), 180));
        let service = HistoryService::new(Arc::new(store), "commute");

        let samples = service
            .fetch_history("Paris", "1", anchor(0, 0, 0), SamplingInterval::HOURLY)
            .await
            .unwrap();

        let times: Vec<_> = samples.iter().map(|s| s.time.as_str()).collect();
        assert_eq!(
            times,
            vec![
                "2020-01-01T00:00:00Z",
                "2020-01-01T01:00:00Z",
                "2020-01-01T02:00:00Z"
            ]
        );
        assert_eq!(samples[0].available_bike_stands, 0);
        assert_eq!(samples[0].available_bikes, 20);
    }

    #[tokio::test]
    async fn rows_outside_the_window_are_not_returned() {
        let mut store = MemoryStore::new();
        store.insert_rows("Paris_1", minute_rows(anchor(23, 0, 0).and_utc(), 180));
        let service = HistoryService::new(Arc::new(store), "commute");

        let samples = service
            .fetch_history("Paris", "1", anchor(0, 0, 0), SamplingInterval::new(1).unwrap())
            .await
            .unwrap();
        assert_eq!(samples.len(), 60);
        assert_eq!(samples.last().unwrap().time, "2020-01-01T23:59:00Z");
    }

    #[tokio::test]
    async fn empty_window_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let service = HistoryService::new(store.clone(), "commute");

        let samples = service
            .fetch_history("Paris", "42", anchor(0, 0, 0), SamplingInterval::HOURLY)
            .await
            .unwrap();
        assert!(samples.is_empty());
        assert!(matches!(
            &store.calls()[..],
            [StoreCall::Query { database, .. }] if database == "commute"
        ));
    }

    struct CannedStore(QueryResponse);

    #[async_trait]
    impl TimeSeriesStore for CannedStore {
        async fn query(&self, _: &str, _: &str) -> Result<QueryResponse, StoreError> {
            Ok(self.0.clone())
        }
    }

    async fn fetch_canned(response: QueryResponse) -> Vec<StationBikeState> {
        HistoryService::new(Arc::new(CannedStore(response)), "commute")
            .fetch_history("Paris", "1", anchor(0, 0, 0), SamplingInterval::HOURLY)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn missing_result_set_is_empty() {
        assert!(fetch_canned(QueryResponse::default()).await.is_empty());
    }

    #[tokio::test]
    async fn series_without_rows_is_empty() {
        let response = QueryResponse {
            results: vec![StatementResult {
                statement_id: 0,
                series: vec![Series {
                    name: "Paris_1".to_owned(),
                    columns: vec!["time".to_owned()],
                    values: vec![],
                }],
                error: None,
            }],
            error: None,
        };
        assert!(fetch_canned(response).await.is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let service = HistoryService::new(Arc::new(store), "commute");

        let err = service
            .fetch_history("Paris", "1", anchor(0, 0, 0), SamplingInterval::HOURLY)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::Store { ref measurement, source: StoreError::Unavailable(_) }
                if measurement == "Paris_1"
        ));
    }
}
