//! Listing source contract, the Hiking Buddies adapter and row normalization.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use hbm_core::{event_link, Difficulty, Event, DEFAULT_EVENT_LINK_BASE};
use hbm_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "hbm-adapters";

pub const DEFAULT_EVENT_LIST_URL: &str =
    "https://www.hiking-buddies.com/routes/event_list/get_event_list/";

/// One listing row as delivered: `[unused, name, difficulty, organiser, date, id]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(pub Vec<JsonValue>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingPayload {
    pub data: Vec<RawRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("row has {0} columns, expected at least 6")]
    MissingColumns(usize),
    #[error("malformed date '{0}'")]
    BadDate(String),
    #[error("malformed event id '{0}'")]
    BadId(String),
}

/// Result of normalizing one fetch: the events plus the bookkeeping the cache needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedBatch {
    pub events: Vec<Event>,
    pub max_id: Option<u64>,
    pub dropped: usize,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn event_link_base(&self) -> &str {
        DEFAULT_EVENT_LINK_BASE
    }

    /// Exactly one upstream call, no retries.
    async fn fetch_listing(&self) -> Result<Vec<RawRow>, FetchError>;

    fn parse_listing(&self, rows: Vec<RawRow>) -> NormalizedBatch {
        normalize_rows(rows, self.event_link_base())
    }
}

/// Parses `weekday,day,month,year,hour,minute`. The weekday field is not trusted;
/// the weekday is always derived from the calendar date.
pub fn parse_listing_date(raw: &str) -> Result<NaiveDateTime, AdapterError> {
    let bad = || AdapterError::BadDate(raw.to_string());
    let parts = raw
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| bad())?;
    let [_weekday, day, month, year, hour, minute] = parts[..] else {
        return Err(bad());
    };
    let year = i32::try_from(year).map_err(|_| bad())?;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .ok_or_else(bad)
}

fn cell_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn cell_id(value: Option<&JsonValue>) -> Result<u64, AdapterError> {
    match value {
        Some(JsonValue::Number(n)) => n.as_u64().ok_or_else(|| AdapterError::BadId(n.to_string())),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| AdapterError::BadId(s.clone())),
        other => Err(AdapterError::BadId(cell_text(other))),
    }
}

pub fn normalize_row(row: &RawRow, link_base: &str) -> Result<Event, AdapterError> {
    let cells = &row.0;
    if cells.len() < 6 {
        return Err(AdapterError::MissingColumns(cells.len()));
    }
    let id = cell_id(cells.get(5))?;
    let date = parse_listing_date(&cell_text(cells.get(4)))?;
    Ok(Event {
        id,
        name: cell_text(cells.get(1)),
        difficulty: Difficulty::from_listing_code(&cell_text(cells.get(2))),
        organiser: cell_text(cells.get(3)),
        date,
        link: event_link(link_base, id),
    })
}

/// Normalizes a fetched page. Bad rows are dropped; they never fail the batch.
pub fn normalize_rows(rows: Vec<RawRow>, link_base: &str) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for row in &rows {
        match normalize_row(row, link_base) {
            Ok(event) => {
                batch.max_id = Some(batch.max_id.map_or(event.id, |m| m.max(event.id)));
                batch.events.push(event);
            }
            Err(err) => {
                warn!(error = %err, row = ?row.0, "dropping malformed listing row");
                batch.dropped += 1;
            }
        }
    }
    batch
}

/// DataTables parameters the listing endpoint expects echoed back verbatim.
pub fn listing_params(page_length: usize) -> Vec<(String, String)> {
    // (searchable, orderable, search regex) per column.
    const COLUMNS: [(bool, bool, bool); 6] = [
        (false, false, false),
        (true, true, false),
        (false, true, true),
        (false, true, false),
        (false, true, false),
        (false, true, false),
    ];
    let flag = |b: bool| (if b { "True" } else { "False" }).to_string();

    let mut params = vec![("draw".to_string(), "5".to_string())];
    for (i, (searchable, orderable, regex)) in COLUMNS.into_iter().enumerate() {
        params.push((format!("columns[{i}][data]"), i.to_string()));
        params.push((format!("columns[{i}][name]"), String::new()));
        params.push((format!("columns[{i}][searchable]"), flag(searchable)));
        params.push((format!("columns[{i}][orderable]"), flag(orderable)));
        params.push((format!("columns[{i}][search][value]"), String::new()));
        params.push((format!("columns[{i}][search][regex]"), flag(regex)));
    }
    params.extend([
        ("start".to_string(), "0".to_string()),
        ("length".to_string(), page_length.to_string()),
        ("search[value]".to_string(), String::new()),
        ("search[regex]".to_string(), flag(false)),
        ("id".to_string(), "id_future".to_string()),
    ]);
    params
}

#[derive(Debug, Clone)]
pub struct HikingBuddiesSource {
    http: HttpFetcher,
    list_url: String,
    link_base: String,
    page_length: usize,
}

impl HikingBuddiesSource {
    pub fn new(
        http: HttpFetcher,
        list_url: impl Into<String>,
        link_base: impl Into<String>,
        page_length: usize,
    ) -> Self {
        Self {
            http,
            list_url: list_url.into(),
            link_base: link_base.into(),
            page_length: page_length.max(1),
        }
    }
}

#[async_trait]
impl EventSource for HikingBuddiesSource {
    fn source_id(&self) -> &'static str {
        "hiking-buddies"
    }

    fn event_link_base(&self) -> &str {
        &self.link_base
    }

    async fn fetch_listing(&self) -> Result<Vec<RawRow>, FetchError> {
        let payload: ListingPayload = self
            .http
            .fetch_json(
                self.source_id(),
                &self.list_url,
                &listing_params(self.page_length),
            )
            .await?;
        debug!(rows = payload.data.len(), "fetched listing page");
        Ok(payload.data)
    }
}

pub fn load_listing_fixture(path: impl AsRef<Path>) -> Result<ListingPayload> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Weekday};
    use serde_json::json;

    fn row(values: JsonValue) -> RawRow {
        serde_json::from_value(values).unwrap()
    }

    #[test]
    fn parses_listing_date_ignoring_weekday_field() {
        let date = parse_listing_date("6,24,10,2026,7,30").unwrap();
        assert_eq!(date.to_string(), "2026-10-24 07:30:00");
        assert_eq!(date.weekday(), Weekday::Sat);
        // A wrong weekday code does not matter; the calendar date wins.
        assert_eq!(parse_listing_date("2,24,10,2026,7,30").unwrap(), date);
    }

    #[test]
    fn rejects_malformed_dates() {
        for raw in ["", "6,24,10,2026,7", "6,32,10,2026,7,30", "x,24,10,2026,7,30", "6,24,10,2026,25,0"] {
            assert!(parse_listing_date(raw).is_err(), "{raw} should fail");
        }
    }

    #[test]
    fn normalizes_rows_with_string_or_numeric_ids() {
        let rows = vec![
            row(json!(["", "Jochberg", "T2", "Amit", "6,24,10,2026,8,0", 1021])),
            row(json!(["", "Zugspitze", "T5", "Lena", "7,25,10,2026,6,15", "1030"])),
        ];
        let batch = normalize_rows(rows, DEFAULT_EVENT_LINK_BASE);
        assert_eq!(batch.dropped, 0);
        assert_eq!(batch.max_id, Some(1030));
        assert_eq!(batch.events[0].id, 1021);
        assert_eq!(batch.events[1].difficulty, Difficulty::T5);
        assert_eq!(
            batch.events[1].link,
            "https://www.hiking-buddies.com/routes/events/1030/"
        );
    }

    #[test]
    fn malformed_rows_are_dropped_not_fatal() {
        let rows = vec![
            row(json!(["", "Short row"])),
            row(json!(["", "Bad date", "T2", "Amit", "soon", 5])),
            row(json!(["", "Bad id", "T2", "Amit", "6,24,10,2026,8,0", "abc"])),
            row(json!(["", "Good", "T9", "Amit", "6,24,10,2026,8,0", 7])),
        ];
        let batch = normalize_rows(rows, DEFAULT_EVENT_LINK_BASE);
        assert_eq!(batch.dropped, 3);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].difficulty, Difficulty::T0);
        assert_eq!(batch.max_id, Some(7));
    }

    #[test]
    fn empty_page_has_no_max_id() {
        let batch = normalize_rows(Vec::new(), DEFAULT_EVENT_LINK_BASE);
        assert_eq!(batch, NormalizedBatch::default());
    }

    #[test]
    fn display_weekday_matches_parsed_date() {
        let rows = vec![
            row(json!(["", "A", "T1", "X", "1,26,10,2026,9,0", 1])),
            row(json!(["", "B", "T1", "X", "3,31,12,2026,23,45", 2])),
            row(json!(["", "C", "T1", "X", "7,1,11,2026,0,5", 3])),
        ];
        for event in normalize_rows(rows, DEFAULT_EVENT_LINK_BASE).events {
            let label = event.date.format("%a").to_string();
            assert!(event.display_date().starts_with(&label));
        }
    }

    #[test]
    fn listing_params_echo_datatables_shape() {
        let params = listing_params(100);
        assert_eq!(params.len(), 1 + 6 * 6 + 5);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("draw"), Some("5"));
        assert_eq!(get("columns[0][orderable]"), Some("False"));
        assert_eq!(get("columns[1][searchable]"), Some("True"));
        assert_eq!(get("columns[2][search][regex]"), Some("True"));
        assert_eq!(get("columns[5][data]"), Some("5"));
        assert_eq!(get("length"), Some("100"));
        assert_eq!(get("id"), Some("id_future"));
    }
}
