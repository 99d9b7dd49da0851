//! Source connector contracts plus the OTP, METAR and TSA implementations.
//!
//! Each connector owns its upstream request shape and auth, returns a
//! [`RawBatch`], and maps that batch onto its dataset's canonical schema.

use async_trait::async_trait;
use avi_core::{
    Cell, DateRange, MalformedRecord, MalformedRowPolicy, NormalizedTable, RawBatch, RawTable,
    RequestParams, SourceId, TableSchema,
};
use avi_storage::{FetchError, HttpFetcher};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

mod daily;
mod metar;
mod otp;
pub mod parse;
mod tsa;

pub use daily::{
    build_daily_movements, daily_metar_features, metar_daily_schema, otp_daily_schema, DailySummary,
};
pub use metar::{metar_schema, parse_metar_csv, MetarConnector, DEFAULT_METAR_URL};
pub use otp::{icao_to_iata, otp_schema, parse_otp_page, OtpConnector, DEFAULT_OTP_URL};
pub use tsa::{parse_tsa_csv, tsa_schema, TsaConnector, DEFAULT_TSA_URL};

pub const CRATE_NAME: &str = "avi-adapters";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),
    #[error("upstream schema changed: {0}")]
    UpstreamSchemaChanged(String),
}

impl ConnectorError {
    /// Only throttling is worth waiting out; a schema change needs a code change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::UpstreamRateLimited(_))
    }
}

impl From<FetchError> for ConnectorError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { .. } => ConnectorError::UpstreamRateLimited(err.to_string()),
            FetchError::HttpStatus { .. } | FetchError::Request(_) => {
                ConnectorError::UpstreamUnavailable(err.to_string())
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed record at row {row}: {reason}")]
    MalformedRecord { row: usize, reason: String },
    #[error("{source_id} batch has no column matching `{column}`")]
    MissingColumn { source_id: SourceId, column: String },
}

/// Fetch + normalize capability implemented once per upstream.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> SourceId;

    fn schema(&self) -> TableSchema;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        params: &RequestParams,
    ) -> Result<RawBatch, ConnectorError>;

    /// Pure and deterministic: same batch and policy, same table.
    fn normalize(
        &self,
        batch: &RawBatch,
        policy: MalformedRowPolicy,
    ) -> Result<NormalizedTable, NormalizeError>;

    /// Day-grain rollup persisted beside an accepted table, for sources that have one.
    fn daily_summary(&self, _table: &NormalizedTable, _params: &RequestParams) -> Option<DailySummary> {
        None
    }
}

/// Endpoint and credential settings handed to a connector at construction.
#[derive(Debug, Clone, Default)]
pub struct ConnectorSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub user_agent: Option<String>,
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
}

pub fn connector_for_source(source_id: SourceId, settings: &ConnectorSettings) -> Box<dyn SourceConnector> {
    match source_id {
        SourceId::Otp => Box::new(OtpConnector::from_settings(settings)),
        SourceId::Metar => Box::new(MetarConnector::from_settings(settings)),
        SourceId::Tsa => Box::new(TsaConnector::from_settings(settings)),
    }
}

/// Canonical schema of a source without constructing a connector.
pub fn schema_for_source(source_id: SourceId) -> TableSchema {
    match source_id {
        SourceId::Otp => otp_schema(),
        SourceId::Metar => metar_schema(),
        SourceId::Tsa => tsa_schema(),
    }
}

/// Index of the first header matching any alias, or `MissingColumn`.
pub(crate) fn require_column(
    source_id: SourceId,
    table: &RawTable,
    aliases: &[&str],
) -> Result<usize, NormalizeError> {
    table
        .column_index_any(aliases)
        .ok_or_else(|| NormalizeError::MissingColumn {
            source_id,
            column: aliases.first().copied().unwrap_or_default().to_string(),
        })
}

/// Resolves canonical columns against a raw header row, remembering which
/// headers were consumed and which canonical columns found no header.
pub(crate) struct ColumnResolver<'a> {
    source_id: SourceId,
    table: &'a RawTable,
    used: Vec<bool>,
    missing: Vec<String>,
}

impl<'a> ColumnResolver<'a> {
    pub(crate) fn new(source_id: SourceId, table: &'a RawTable) -> Self {
        Self {
            source_id,
            table,
            used: vec![false; table.headers.len()],
            missing: Vec::new(),
        }
    }

    pub(crate) fn require(&mut self, aliases: &[&str]) -> Result<usize, NormalizeError> {
        let idx = require_column(self.source_id, self.table, aliases)?;
        self.claim(idx);
        Ok(idx)
    }

    /// Looks a column up and records `canonical` as missing when no alias matches.
    pub(crate) fn optional(&mut self, canonical: &str, aliases: &[&str]) -> Option<usize> {
        let idx = self.find(aliases);
        if idx.is_none() {
            self.mark_missing(canonical);
        }
        idx
    }

    /// Looks a column up without judging its absence.
    pub(crate) fn find(&mut self, aliases: &[&str]) -> Option<usize> {
        let idx = self.table.column_index_any(aliases);
        if let Some(idx) = idx {
            self.claim(idx);
        }
        idx
    }

    pub(crate) fn claim(&mut self, idx: usize) {
        if let Some(slot) = self.used.get_mut(idx) {
            *slot = true;
        }
    }

    pub(crate) fn mark_missing(&mut self, canonical: &str) {
        if !self.missing.iter().any(|m| m == canonical) {
            self.missing.push(canonical.to_string());
        }
    }

    /// Stamps the gaps onto `table`. Unclaimed non-blank headers are extras.
    pub(crate) fn annotate(self, mut table: NormalizedTable) -> NormalizedTable {
        table.extra_columns = self
            .table
            .headers
            .iter()
            .zip(&self.used)
            .filter(|(header, used)| !**used && !header.trim().is_empty())
            .map(|(header, _)| header.trim().to_string())
            .collect();
        table.missing_columns = self.missing;
        if !table.missing_columns.is_empty() || !table.extra_columns.is_empty() {
            debug!(
                source_id = %table.source_id,
                missing = ?table.missing_columns,
                extra = ?table.extra_columns,
                "upstream headers differ from canonical schema"
            );
        }
        table
    }
}

/// Applies `coerce` to every raw row, dropping or aborting on malformed rows
/// per `policy`. Row order is preserved.
pub(crate) fn normalize_rows<F>(
    batch: &RawBatch,
    schema: TableSchema,
    policy: MalformedRowPolicy,
    mut coerce: F,
) -> Result<NormalizedTable, NormalizeError>
where
    F: FnMut(&[String]) -> Result<Vec<Cell>, String>,
{
    let mut rows = Vec::with_capacity(batch.table.len());
    let mut dropped_rows = Vec::new();
    for (idx, raw) in batch.table.rows.iter().enumerate() {
        match coerce(raw) {
            Ok(cells) => rows.push(cells),
            Err(reason) => match policy {
                MalformedRowPolicy::Drop => {
                    debug!(source_id = %batch.source_id, row = idx, %reason, "dropping malformed row");
                    dropped_rows.push(MalformedRecord { row: idx, reason });
                }
                MalformedRowPolicy::Abort => {
                    return Err(NormalizeError::MalformedRecord { row: idx, reason });
                }
            },
        }
    }
    Ok(NormalizedTable {
        source_id: batch.source_id,
        schema,
        rows,
        requested_range: batch.requested_range,
        returned_range: batch.returned_range,
        dropped_rows,
        missing_columns: Vec::new(),
        extra_columns: Vec::new(),
    })
}

pub(crate) fn empty_table(batch: &RawBatch, schema: TableSchema) -> NormalizedTable {
    NormalizedTable {
        source_id: batch.source_id,
        schema,
        rows: Vec::new(),
        requested_range: batch.requested_range,
        returned_range: batch.returned_range,
        dropped_rows: Vec::new(),
        missing_columns: Vec::new(),
        extra_columns: Vec::new(),
    }
}

/// Raw cell at `idx`, or `""` when the column is absent or the row is short.
pub(crate) fn field(row: &[String], idx: Option<usize>) -> &str {
    idx.and_then(|i| row.get(i)).map(String::as_str).unwrap_or("")
}

fn row_date(row: &[String], date_column: Option<usize>) -> Option<NaiveDate> {
    let idx = date_column?;
    parse::date(row.get(idx)?).ok()
}

/// Calendar span of the parseable dates in `date_column`.
pub(crate) fn observed_range(table: &RawTable, date_column: Option<usize>) -> Option<DateRange> {
    DateRange::spanning(table.rows.iter().filter_map(|row| row_date(row, date_column)))
}

/// Drops rows whose date is parseable and outside `range`. Unparseable
/// dates are kept so the normalizer can report them as malformed.
pub(crate) fn retain_in_range(table: &mut RawTable, date_column: Option<usize>, range: DateRange) {
    let Some(idx) = date_column else {
        return;
    };
    table.rows.retain(|row| match row.get(idx).map(|v| parse::date(v)) {
        Some(Ok(day)) => range.contains(day),
        _ => true,
    });
}

/// Reads CSV text with a header row into a [`RawTable`]. Short rows are padded.
pub(crate) fn read_csv(text: &str) -> Result<RawTable, ConnectorError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| ConnectorError::UpstreamSchemaChanged(format!("unreadable CSV header: {e}")))?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let width = headers.len();
    let mut table = RawTable::new(headers);
    for record in reader.records() {
        let record = record
            .map_err(|e| ConnectorError::UpstreamSchemaChanged(format!("unreadable CSV row: {e}")))?;
        let mut row = record.iter().map(ToString::to_string).collect::<Vec<_>>();
        if row.iter().all(|v| v.is_empty()) {
            continue;
        }
        if row.len() < width {
            row.resize(width, String::new());
        }
        table.rows.push(row);
    }
    Ok(table)
}
