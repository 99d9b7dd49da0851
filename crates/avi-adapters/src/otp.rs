use std::collections::BTreeMap;

use async_trait::async_trait;
use avi_core::{
    Cell, ColumnSpec, ColumnType, MalformedRowPolicy, NormalizedTable, RawBatch, RawTable,
    RequestParams, SourceId, TableSchema,
};
use avi_storage::{HttpFetcher, HttpRequest};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::daily::{build_daily_movements, DailySummary};
use crate::{
    empty_table, field, normalize_rows, observed_range, parse, retain_in_range, ColumnResolver,
    ConnectorError, ConnectorSettings, NormalizeError, SourceConnector,
};

/// Flight-records endpoint; deployments point `base_url` at their mirror.
pub const DEFAULT_OTP_URL: &str = "https://api.data.gov/bts/on-time-performance/v1/flights";
const DEFAULT_PAGE_SIZE: usize = 1_000;
const DEFAULT_MAX_PAGES: usize = 500;

const FLIGHT_DATE: &[&str] = &["flight_date", "FlightDate", "fl_date"];
const CARRIER: &[&str] = &["carrier", "Reporting_Airline", "op_unique_carrier"];
const FLIGHT_NUMBER: &[&str] = &[
    "flight_number",
    "Flight_Number_Reporting_Airline",
    "op_carrier_fl_num",
];
const ORIGIN: &[&str] = &["origin", "Origin"];
const DEST: &[&str] = &["dest", "Dest"];
const DEP_DELAY: &[&str] = &["dep_delay_min", "DepDelay", "dep_delay"];
const ARR_DELAY: &[&str] = &["arr_delay_min", "ArrDelay", "arr_delay"];
const CANCELLED: &[&str] = &["cancelled", "Cancelled"];
const DIVERTED: &[&str] = &["diverted", "Diverted"];

pub fn otp_schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnSpec::required("flight_date", ColumnType::Date),
            ColumnSpec::required("carrier", ColumnType::Identifier),
            ColumnSpec::required("flight_number", ColumnType::Identifier),
            ColumnSpec::required("origin", ColumnType::Categorical),
            ColumnSpec::required("dest", ColumnType::Categorical),
            ColumnSpec::nullable("dep_delay_min", ColumnType::Float),
            ColumnSpec::nullable("arr_delay_min", ColumnType::Float),
            ColumnSpec::nullable("cancelled", ColumnType::Boolean),
            ColumnSpec::nullable("diverted", ColumnType::Boolean),
        ],
        primary_key: vec![
            "flight_date".to_string(),
            "carrier".to_string(),
            "flight_number".to_string(),
        ],
        date_column: "flight_date".to_string(),
    }
}

/// `KJFK` -> `JFK`. Anything that is not a four-letter K-prefixed code is
/// passed through upper-cased.
pub fn icao_to_iata(code: &str) -> String {
    let code = code.trim().to_ascii_uppercase();
    if code.len() == 4 && code.starts_with('K') && code.chars().all(|c| c.is_ascii_alphabetic()) {
        code[1..].to_string()
    } else {
        code
    }
}

/// Parses one page of `{"data": [{...}], "next_page": n|null}`.
///
/// Headers are the union of record keys; values are flattened to strings
/// (`null` becomes empty) so the normalizer sees the same shape as CSV input.
pub fn parse_otp_page(body: &[u8]) -> Result<(RawTable, Option<u32>), ConnectorError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| ConnectorError::UpstreamSchemaChanged(format!("otp body is not JSON: {e}")))?;
    let records = value
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            ConnectorError::UpstreamSchemaChanged("otp body has no `data` array".to_string())
        })?;

    let next_page = match value.get("next_page") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Number(n)) => Some(
            n.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    ConnectorError::UpstreamSchemaChanged(format!("otp next_page `{n}` is not a page number"))
                })?,
        ),
        Some(other) => {
            return Err(ConnectorError::UpstreamSchemaChanged(format!(
                "otp next_page has unexpected value {other}"
            )))
        }
    };

    let mut objects = Vec::with_capacity(records.len());
    let mut headers: Vec<String> = Vec::new();
    for (idx, record) in records.iter().enumerate() {
        let object = record.as_object().ok_or_else(|| {
            ConnectorError::UpstreamSchemaChanged(format!("otp record {idx} is not an object"))
        })?;
        for key in object.keys() {
            if !headers.iter().any(|h| h == key) {
                headers.push(key.clone());
            }
        }
        objects.push(object);
    }

    let mut table = RawTable::new(headers);
    for object in objects {
        let row = table
            .headers
            .iter()
            .map(|h| object.get(h).map(flatten).unwrap_or_default())
            .collect();
        table.rows.push(row);
    }
    Ok((table, next_page))
}

fn flatten(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `0123` and `123` name the same flight.
fn canonical_flight_number(raw: &str) -> Result<String, String> {
    let text = parse::required_text(raw, "flight_number", true)?;
    if text.chars().all(|c| c.is_ascii_digit()) {
        let trimmed = text.trim_start_matches('0');
        return Ok(if trimmed.is_empty() { "0" } else { trimmed }.to_string());
    }
    Ok(text)
}

#[derive(Debug, Clone)]
pub struct OtpConnector {
    base_url: String,
    api_key: Option<String>,
    page_size: usize,
    max_pages: usize,
}

impl OtpConnector {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn from_settings(settings: &ConnectorSettings) -> Self {
        Self {
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OTP_URL.to_string()),
            api_key: settings.api_key.clone(),
            page_size: settings.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            max_pages: settings.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1),
        }
    }

    fn page_request(&self, params: &RequestParams, api_key: &str, page: u32) -> HttpRequest {
        let mut request = HttpRequest::get(&self.base_url)
            .query("start_date", params.range.start().to_string())
            .query("end_date", params.range.end().to_string())
            .query("page", page.to_string())
            .query("page_size", self.page_size.to_string())
            .query("api_key", api_key);
        if !params.stations.is_empty() {
            let airports = params
                .stations
                .iter()
                .map(|s| icao_to_iata(s))
                .collect::<Vec<_>>()
                .join(",");
            request = request.query("airports", airports);
        }
        request
    }
}

#[async_trait]
impl SourceConnector for OtpConnector {
    fn source_id(&self) -> SourceId {
        SourceId::Otp
    }

    fn schema(&self) -> TableSchema {
        otp_schema()
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        params: &RequestParams,
    ) -> Result<RawBatch, ConnectorError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ConnectorError::UpstreamUnavailable("otp api key is not configured".to_string())
        })?;

        let mut table = RawTable::default();
        let mut page = 1u32;
        let mut pages_fetched = 0usize;
        loop {
            let response = http
                .fetch(SourceId::Otp, &self.page_request(params, api_key, page))
                .await?;
            let (page_table, next_page) = parse_otp_page(&response.body)?;
            debug!(page, rows = page_table.len(), "otp page parsed");
            table.extend_from(page_table);
            pages_fetched += 1;

            match next_page {
                None => break,
                Some(next) if next <= page => {
                    return Err(ConnectorError::UpstreamSchemaChanged(format!(
                        "otp next_page {next} does not advance past page {page}"
                    )));
                }
                Some(_) if pages_fetched >= self.max_pages => {
                    return Err(ConnectorError::UpstreamUnavailable(format!(
                        "otp pagination exceeded {} pages",
                        self.max_pages
                    )));
                }
                Some(next) => page = next,
            }
        }

        let date_idx = table.column_index_any(FLIGHT_DATE);
        retain_in_range(&mut table, date_idx, params.range);
        let returned_range = observed_range(&table, date_idx);
        info!(rows = table.len(), pages = pages_fetched, "otp fetch complete");

        let mut request_meta = BTreeMap::new();
        request_meta.insert("url".to_string(), self.base_url.clone());
        request_meta.insert("pages".to_string(), pages_fetched.to_string());
        request_meta.insert("page_size".to_string(), self.page_size.to_string());
        request_meta.insert("stations".to_string(), params.stations.join(","));

        Ok(RawBatch {
            source_id: SourceId::Otp,
            params: params.clone(),
            requested_range: params.range,
            returned_range,
            fetched_at: Utc::now(),
            request_meta,
            table,
        })
    }

    fn normalize(
        &self,
        batch: &RawBatch,
        policy: MalformedRowPolicy,
    ) -> Result<NormalizedTable, NormalizeError> {
        let table = &batch.table;
        if table.is_empty() {
            return Ok(empty_table(batch, otp_schema()));
        }
        let mut columns = ColumnResolver::new(SourceId::Otp, table);
        let date = columns.require(FLIGHT_DATE)?;
        let carrier = columns.require(CARRIER)?;
        let flight_number = columns.require(FLIGHT_NUMBER)?;
        let origin = columns.require(ORIGIN)?;
        let dest = columns.require(DEST)?;
        let dep_delay = columns.optional("dep_delay_min", DEP_DELAY);
        let arr_delay = columns.optional("arr_delay_min", ARR_DELAY);
        let cancelled = columns.optional("cancelled", CANCELLED);
        let diverted = columns.optional("diverted", DIVERTED);

        let normalized = normalize_rows(batch, otp_schema(), policy, |row| {
            let flight_date = parse::date(field(row, Some(date)))?;
            Ok(vec![
                Cell::Date(flight_date),
                Cell::Text(parse::required_text(field(row, Some(carrier)), "carrier", true)?),
                Cell::Text(canonical_flight_number(field(row, Some(flight_number)))?),
                Cell::Text(parse::required_text(field(row, Some(origin)), "origin", true)?),
                Cell::Text(parse::required_text(field(row, Some(dest)), "dest", true)?),
                parse::optional_f64(field(row, dep_delay))
                    .map_err(|e| format!("dep_delay_min: {e}"))?
                    .map_or(Cell::Null, Cell::Float),
                parse::optional_f64(field(row, arr_delay))
                    .map_err(|e| format!("arr_delay_min: {e}"))?
                    .map_or(Cell::Null, Cell::Float),
                parse::optional_flag(field(row, cancelled))
                    .map_err(|e| format!("cancelled: {e}"))?
                    .map_or(Cell::Null, Cell::Boolean),
                parse::optional_flag(field(row, diverted))
                    .map_err(|e| format!("diverted: {e}"))?
                    .map_or(Cell::Null, Cell::Boolean),
            ])
        })?;
        Ok(columns.annotate(normalized))
    }

    fn daily_summary(&self, table: &NormalizedTable, params: &RequestParams) -> Option<DailySummary> {
        Some(DailySummary {
            name: "otp_daily",
            table: build_daily_movements(table, &params.stations),
        })
    }
}
