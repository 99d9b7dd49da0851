//! Core data model and provenance types for aviation dataset ingestion.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "avi-core";

/// One of the three upstream datasets the pipeline knows how to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Flight on-time performance records.
    Otp,
    /// Airport weather observations.
    Metar,
    /// Checkpoint passenger throughput counts.
    Tsa,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Otp, SourceId::Metar, SourceId::Tsa];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Otp => "otp",
            SourceId::Metar => "metar",
            SourceId::Tsa => "tsa",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceId::Otp => "BTS On-Time Performance",
            SourceId::Metar => "NOAA METAR observations",
            SourceId::Tsa => "TSA checkpoint throughput",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source `{0}` (expected one of: otp, metar, tsa)")]
pub struct UnknownSource(pub String);

impl FromStr for SourceId {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otp" => Ok(SourceId::Otp),
            "metar" => Ok(SourceId::Metar),
            "tsa" => Ok(SourceId::Tsa),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid date range: start {start} is after end {end}")]
pub struct InvalidDateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Inclusive calendar-day range. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "DateRangeRepr")]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct DateRangeRepr {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<DateRangeRepr> for DateRange {
    type Error = InvalidDateRange;

    fn try_from(value: DateRangeRepr) -> Result<Self, Self::Error> {
        DateRange::new(value.start, value.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InvalidDateRange> {
        if start > end {
            return Err(InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// Smallest range spanning every date in `dates`; `None` when empty.
    pub fn spanning<I: IntoIterator<Item = NaiveDate>>(dates: I) -> Option<Self> {
        let mut iter = dates.into_iter();
        let first = iter.next()?;
        let (start, end) = iter.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        self.start.iter_days().take(self.days())
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Exact request identity used for caching and idempotency checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestParams {
    pub source_id: SourceId,
    pub range: DateRange,
    #[serde(default)]
    pub stations: Vec<String>,
}

impl RequestParams {
    /// Builds already-normalized params.
    pub fn new<I, S>(source_id: SourceId, range: DateRange, stations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_id,
            range,
            stations: stations.into_iter().map(Into::into).collect(),
        }
        .normalized()
    }

    /// Stations trimmed, upper-cased, sorted and deduplicated.
    pub fn normalized(&self) -> Self {
        let mut stations = self
            .stations
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        stations.sort();
        stations.dedup();
        Self {
            source_id: self.source_id,
            range: self.range,
            stations,
        }
    }

    /// SHA-256 hex of the normalized params as canonical JSON (sorted keys,
    /// no whitespace).
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn canonical_json(&self) -> String {
        let normalized = self.normalized();
        json!({
            "end": normalized.range.end().to_string(),
            "source_id": normalized.source_id.as_str(),
            "start": normalized.range.start().to_string(),
            "stations": normalized.stations,
        })
        .to_string()
    }
}

/// Untyped tabular payload exactly as a connector read it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Case-insensitive, whitespace-trimmed header lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let wanted = name.trim();
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(wanted))
    }

    /// First header among `names` that exists.
    pub fn column_index_any(&self, names: &[&str]) -> Option<usize> {
        names.iter().find_map(|name| self.column_index(name))
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
    }

    /// Appends `other`, aligning columns by header name. Headers missing on
    /// either side are filled with empty strings.
    pub fn extend_from(&mut self, other: RawTable) {
        if self.headers.is_empty() && self.rows.is_empty() {
            *self = other;
            return;
        }
        let mut mapping = Vec::with_capacity(other.headers.len());
        for header in &other.headers {
            let idx = match self.column_index(header) {
                Some(idx) => idx,
                None => {
                    self.headers.push(header.clone());
                    for row in &mut self.rows {
                        row.push(String::new());
                    }
                    self.headers.len() - 1
                }
            };
            mapping.push(idx);
        }
        let width = self.headers.len();
        for row in other.rows {
            let mut aligned = vec![String::new(); width];
            for (value, &idx) in row.into_iter().zip(&mapping) {
                aligned[idx] = value;
            }
            self.rows.push(aligned);
        }
    }
}

/// Connector output: raw table plus fetch metadata. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBatch {
    pub source_id: SourceId,
    pub params: RequestParams,
    pub requested_range: DateRange,
    pub returned_range: Option<DateRange>,
    pub fetched_at: DateTime<Utc>,
    pub request_meta: BTreeMap<String, String>,
    pub table: RawTable,
}

impl RawBatch {
    pub fn is_partial(&self) -> bool {
        self.returned_range != Some(self.requested_range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Date,
    Timestamp,
    Integer,
    Float,
    Boolean,
    Categorical,
    Identifier,
}

impl ColumnType {
    pub fn is_temporal(&self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::Timestamp)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// One typed value of a normalized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cell {
    Null,
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Null conforms to every type; nullability is a schema concern.
    pub fn conforms_to(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Cell::Null, _)
                | (Cell::Date(_), ColumnType::Date)
                | (Cell::Timestamp(_), ColumnType::Timestamp)
                | (Cell::Integer(_), ColumnType::Integer)
                | (Cell::Float(_), ColumnType::Float)
                | (Cell::Boolean(_), ColumnType::Boolean)
                | (Cell::Text(_), ColumnType::Categorical | ColumnType::Identifier)
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Calendar date of a date or timestamp cell.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(d) => Some(*d),
            Cell::Timestamp(ts) => Some(ts.date_naive()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("null"),
            Cell::Date(d) => write!(f, "{d}"),
            Cell::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Cell::Integer(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Boolean(v) => write!(f, "{v}"),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn nullable(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: true,
        }
    }

    pub fn required(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: false,
        }
    }
}

/// Canonical column set, primary key and coverage column of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Vec<String>,
    pub date_column: String,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Indices of the primary-key columns; `None` if any is missing.
    pub fn key_indices(&self) -> Option<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|k| self.column_index(k))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRecord {
    /// Zero-based index into the raw table's rows.
    pub row: usize,
    pub reason: String,
}

/// What the normalizer does with a row it cannot coerce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRowPolicy {
    Drop,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTable {
    pub source_id: SourceId,
    pub schema: TableSchema,
    pub rows: Vec<Vec<Cell>>,
    pub requested_range: DateRange,
    pub returned_range: Option<DateRange>,
    #[serde(default)]
    pub dropped_rows: Vec<MalformedRecord>,
    /// Canonical columns with no matching upstream header; their cells are null.
    #[serde(default)]
    pub missing_columns: Vec<String>,
    /// Upstream headers that map onto no canonical column.
    #[serde(default)]
    pub extra_columns: Vec<String>,
}

impl NormalizedTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cells of one named column in row order.
    pub fn column_values<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a Cell> + 'a> {
        let idx = self.schema.column_index(name)?;
        Some(self.rows.iter().map(move |row| row.get(idx).unwrap_or(&Cell::Null)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Outcome of a single validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub rule_name: String,
    pub status: CheckStatus,
    /// Whether a `Fail` from this rule forces rejection.
    pub blocking: bool,
    pub detail: String,
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub expected: Option<String>,
}

impl CheckResult {
    pub fn new(rule_name: impl Into<String>, status: CheckStatus, blocking: bool, detail: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            status,
            blocking,
            detail: detail.into(),
            value: None,
            expected: None,
        }
    }

    pub fn with_value(mut self, value: JsonValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.status != CheckStatus::Fail
    }

    pub fn is_blocking_failure(&self) -> bool {
        self.blocking && self.status == CheckStatus::Fail
    }
}

/// Full, ordered rule outcomes plus the derived accept/reject decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<CheckResult>,
    pub accepted: bool,
}

impl ValidationReport {
    pub fn from_results(results: Vec<CheckResult>) -> Self {
        let accepted = !results.iter().any(CheckResult::is_blocking_failure);
        Self { results, accepted }
    }

    pub fn result(&self, rule_name: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.rule_name == rule_name)
    }

    pub fn blocking_failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.is_blocking_failure())
    }

    /// Advisory findings: warnings and non-blocking failures.
    pub fn advisories(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| {
            r.status == CheckStatus::Warn || (r.status == CheckStatus::Fail && !r.blocking)
        })
    }

    pub fn summary(&self) -> String {
        let blocking = self
            .blocking_failures()
            .map(|r| r.rule_name.as_str())
            .collect::<Vec<_>>();
        let advisories = self.advisories().count();
        if self.accepted {
            format!(
                "accepted: {}/{} rules passed, {} advisory",
                self.results.iter().filter(|r| r.passed()).count(),
                self.results.len(),
                advisories
            )
        } else {
            format!(
                "rejected: blocking failures [{}], {} advisory",
                blocking.join(", "),
                advisories
            )
        }
    }
}

/// Failure categories recorded on manifest entries for unsuccessful attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UpstreamUnavailable,
    UpstreamRateLimited,
    UpstreamSchemaChanged,
    MalformedRecord,
    WriteFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
}

/// Append-only provenance record, exactly one per ingestion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub attempt_id: Uuid,
    pub source_id: SourceId,
    pub request_params: RequestParams,
    pub request_fingerprint: String,
    pub attempted_at: DateTime<Utc>,
    pub accepted: bool,
    pub row_count: usize,
    #[serde(default)]
    pub dropped_rows: usize,
    pub returned_range: Option<DateRange>,
    pub output_path: Option<String>,
    #[serde(default)]
    pub output_sha256: Option<String>,
    /// Daily aggregates written alongside `output_path`, relative to the data dir.
    #[serde(default)]
    pub derived_outputs: Vec<String>,
    pub validation_summary: String,
    #[serde(default)]
    pub report: Option<ValidationReport>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn date_range_rejects_inverted_bounds() {
        let err = DateRange::new(day(2023, 1, 5), day(2023, 1, 1)).unwrap_err();
        assert_eq!(err.start, day(2023, 1, 5));
        assert!(serde_json::from_str::<DateRange>(r#"{"start":"2023-01-05","end":"2023-01-01"}"#).is_err());
    }

    #[test]
    fn date_range_counts_days_inclusively() {
        let range = DateRange::new(day(2023, 1, 30), day(2023, 2, 2)).unwrap();
        assert_eq!(range.days(), 4);
        let days = range.iter_days().collect::<Vec<_>>();
        assert_eq!(days.first(), Some(&day(2023, 1, 30)));
        assert_eq!(days.last(), Some(&day(2023, 2, 2)));
        assert!(range.contains(day(2023, 2, 1)));
        assert!(!range.contains(day(2023, 2, 3)));
        assert_eq!(DateRange::single_day(day(2023, 1, 1)).days(), 1);
    }

    #[test]
    fn spanning_finds_min_and_max() {
        let span = DateRange::spanning([day(2023, 1, 3), day(2023, 1, 1), day(2023, 1, 2)]).unwrap();
        assert_eq!(span.to_string(), "2023-01-01..2023-01-03");
        assert!(DateRange::spanning(std::iter::empty()).is_none());
    }

    #[test]
    fn request_params_normalize_station_lists() {
        let range = DateRange::new(day(2023, 1, 1), day(2023, 1, 5)).unwrap();
        let a = RequestParams::new(SourceId::Metar, range, ["kjfk ", "KLAX", "KJFK", ""]);
        let b = RequestParams::new(SourceId::Metar, range, ["KLAX", "KJFK"]);
        assert_eq!(a.stations, vec!["KJFK".to_string(), "KLAX".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let other_source = RequestParams::new(SourceId::Otp, range, ["KLAX", "KJFK"]);
        assert_ne!(a.fingerprint(), other_source.fingerprint());
    }

    #[test]
    fn fingerprint_hashes_canonical_json() {
        let range = DateRange::new(day(2023, 1, 1), day(2023, 1, 2)).unwrap();
        let params = RequestParams {
            source_id: SourceId::Metar,
            range,
            stations: vec!["klax".into(), "KJFK".into()],
        };
        assert_eq!(
            params.canonical_json(),
            r#"{"end":"2023-01-02","source_id":"metar","start":"2023-01-01","stations":["KJFK","KLAX"]}"#
        );
        let mut hasher = Sha256::new();
        hasher.update(params.canonical_json().as_bytes());
        assert_eq!(params.fingerprint(), hex::encode(hasher.finalize()));

        // a station containing the old separator cannot alias another request
        let odd = RequestParams::new(SourceId::Metar, range, ["KJFK,KLAX"]);
        assert_ne!(odd.fingerprint(), params.fingerprint());
    }

    #[test]
    fn source_id_parses_case_insensitively() {
        assert_eq!("TSA".parse::<SourceId>().unwrap(), SourceId::Tsa);
        assert!("opensky".parse::<SourceId>().is_err());
        assert_eq!(serde_json::to_string(&SourceId::Metar).unwrap(), "\"metar\"");
    }

    #[test]
    fn raw_table_extend_aligns_columns_by_header() {
        let mut a = RawTable::new(vec!["station_id".into(), "temp_c".into()]);
        a.rows.push(vec!["KJFK".into(), "3.0".into()]);
        let mut b = RawTable::new(vec!["TEMP_C".into(), "station_id".into(), "wx_string".into()]);
        b.rows.push(vec!["5.0".into(), "KLAX".into(), "RA".into()]);

        a.extend_from(b);
        assert_eq!(a.headers, vec!["station_id", "temp_c", "wx_string"]);
        assert_eq!(a.rows[0], vec!["KJFK", "3.0", ""]);
        assert_eq!(a.rows[1], vec!["KLAX", "5.0", "RA"]);
    }

    #[test]
    fn cell_type_conformance() {
        assert!(Cell::Null.conforms_to(ColumnType::Integer));
        assert!(Cell::Text("AA".into()).conforms_to(ColumnType::Identifier));
        assert!(!Cell::Float(1.0).conforms_to(ColumnType::Integer));
        assert_eq!(Cell::Integer(4).as_f64(), Some(4.0));
    }

    #[test]
    fn report_acceptance_ignores_advisory_failures() {
        let report = ValidationReport::from_results(vec![
            CheckResult::new("schema", CheckStatus::Pass, true, "ok"),
            CheckResult::new("null_ratio", CheckStatus::Fail, false, "12% nulls"),
            CheckResult::new("date_coverage", CheckStatus::Warn, true, "90%"),
        ]);
        assert!(report.accepted);
        assert_eq!(report.advisories().count(), 2);

        let rejected = ValidationReport::from_results(vec![CheckResult::new(
            "duplicate_keys",
            CheckStatus::Fail,
            true,
            "1 duplicate",
        )]);
        assert!(!rejected.accepted);
        assert!(rejected.summary().contains("duplicate_keys"));
    }
}
