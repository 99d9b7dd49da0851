use std::collections::BTreeMap;

use async_trait::async_trait;
use avi_core::{
    Cell, ColumnSpec, ColumnType, MalformedRowPolicy, NormalizedTable, RawBatch, RawTable,
    RequestParams, SourceId, TableSchema,
};
use avi_storage::{HttpFetcher, HttpRequest};
use chrono::Utc;
use tracing::info;

use crate::{
    empty_table, field, normalize_rows, observed_range, parse, read_csv, retain_in_range,
    ColumnResolver, ConnectorError, ConnectorSettings, NormalizeError, SourceConnector,
};

pub const DEFAULT_TSA_URL: &str = "https://www.tsa.gov/sites/default/files/tsa_travel_numbers.csv";

/// Series without a checkpoint breakdown are national totals.
const NATIONAL_CHECKPOINT: &str = "NATIONAL";

const DATE: &[&str] = &["date"];
const CHECKPOINT: &[&str] = &["checkpoint", "airport"];
const TRAVELERS: &[&str] = &[
    "travelers",
    "tsa_travelers",
    "tsa travel numbers",
    "numbers",
    "throughput",
];

pub fn tsa_schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnSpec::required("date", ColumnType::Date),
            ColumnSpec::required("checkpoint", ColumnType::Identifier),
            ColumnSpec::required("travelers", ColumnType::Integer),
        ],
        primary_key: vec!["checkpoint".to_string(), "date".to_string()],
        date_column: "date".to_string(),
    }
}

/// Reads the throughput CSV. Headers are lower-cased; `date` and a
/// travelers column must both be present.
pub fn parse_tsa_csv(text: &str) -> Result<RawTable, ConnectorError> {
    let mut table = read_csv(text)?;
    for header in &mut table.headers {
        *header = header.trim().to_ascii_lowercase();
    }
    if table.column_index_any(DATE).is_none() {
        return Err(ConnectorError::UpstreamSchemaChanged(
            "tsa CSV has no `date` column".to_string(),
        ));
    }
    if table.column_index_any(TRAVELERS).is_none() {
        return Err(ConnectorError::UpstreamSchemaChanged(format!(
            "tsa CSV has no travelers column (headers: {})",
            table.headers.join(", ")
        )));
    }
    Ok(table)
}

#[derive(Debug, Clone)]
pub struct TsaConnector {
    url: String,
}

impl TsaConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_settings(settings: &ConnectorSettings) -> Self {
        Self::new(
            settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_TSA_URL.to_string()),
        )
    }
}

#[async_trait]
impl SourceConnector for TsaConnector {
    fn source_id(&self) -> SourceId {
        SourceId::Tsa
    }

    fn schema(&self) -> TableSchema {
        tsa_schema()
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        params: &RequestParams,
    ) -> Result<RawBatch, ConnectorError> {
        let response = http.fetch(SourceId::Tsa, &HttpRequest::get(&self.url)).await?;
        let mut table = parse_tsa_csv(&response.text())?;
        let upstream_rows = table.len();

        let date_idx = table.column_index_any(DATE);
        retain_in_range(&mut table, date_idx, params.range);
        let returned_range = observed_range(&table, date_idx);
        info!(rows = table.len(), upstream_rows, "tsa fetch complete");

        let mut request_meta = BTreeMap::new();
        request_meta.insert("url".to_string(), response.final_url.clone());
        request_meta.insert("upstream_rows".to_string(), upstream_rows.to_string());

        Ok(RawBatch {
            source_id: SourceId::Tsa,
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
            return Ok(empty_table(batch, tsa_schema()));
        }
        let mut columns = ColumnResolver::new(SourceId::Tsa, table);
        let date = columns.require(DATE)?;
        let travelers = columns.require(TRAVELERS)?;
        // absent means a national series, not a gap
        let checkpoint = columns.find(CHECKPOINT);

        let normalized = normalize_rows(batch, tsa_schema(), policy, |row| {
            let day = parse::date(field(row, Some(date)))?;
            let checkpoint = match checkpoint {
                Some(_) => parse::required_text(field(row, checkpoint), "checkpoint", true)?,
                None => NATIONAL_CHECKPOINT.to_string(),
            };
            let count = parse::optional_count(field(row, Some(travelers)))
                .map_err(|e| format!("travelers: {e}"))?
                .ok_or_else(|| "empty travelers".to_string())?;
            Ok(vec![Cell::Date(day), Cell::Text(checkpoint), Cell::Integer(count)])
        })?;
        Ok(columns.annotate(normalized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_lowercased_and_aliases_resolve() {
        let table = parse_tsa_csv("Date, TSA Travel Numbers\n1/1/2023,\"2,000,000\"\n").unwrap();
        assert_eq!(table.headers, vec!["date", "tsa travel numbers"]);
        assert_eq!(table.column_index_any(TRAVELERS), Some(1));
    }

    #[test]
    fn missing_required_headers_are_schema_changes() {
        assert!(matches!(
            parse_tsa_csv("day,travelers\n2023-01-01,5\n"),
            Err(ConnectorError::UpstreamSchemaChanged(_))
        ));
        assert!(matches!(
            parse_tsa_csv("date,passengers\n2023-01-01,5\n"),
            Err(ConnectorError::UpstreamSchemaChanged(_))
        ));
    }
}
