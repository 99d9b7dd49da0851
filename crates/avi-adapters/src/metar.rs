use std::collections::BTreeMap;

use async_trait::async_trait;
use avi_core::{
    Cell, ColumnSpec, ColumnType, MalformedRowPolicy, NormalizedTable, RawBatch, RawTable,
    RequestParams, SourceId, TableSchema,
};
use avi_storage::{HttpFetcher, HttpRequest};
use chrono::Utc;
use tracing::{debug, info};

use crate::daily::{daily_metar_features, DailySummary};
use crate::{
    empty_table, field, normalize_rows, observed_range, parse, read_csv, retain_in_range,
    ColumnResolver, ConnectorError, ConnectorSettings, NormalizeError, SourceConnector,
};

pub const DEFAULT_METAR_URL: &str = "https://aviationweather.gov/adds/dataserver_current/httpparam";

const METRES_PER_STATUTE_MILE: f64 = 1_609.344;
const CEILING_COVERS: [&str; 3] = ["BKN", "OVC", "OVX"];

const STATION: &[&str] = &["station_id", "station"];
const OBSERVATION_TIME: &[&str] = &["observation_time", "obs_time", "valid"];
const WIND_SPEED: &[&str] = &["wind_speed_kt", "wind_speed"];
const WIND_GUST: &[&str] = &["wind_gust_kt", "wind_gust"];
const VISIBILITY: &[&str] = &["visibility_statute_mi", "visibility"];
const WX_STRING: &[&str] = &["wx_string", "wxcodes"];

pub fn metar_schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnSpec::required("station_id", ColumnType::Identifier),
            ColumnSpec::required("observation_time", ColumnType::Timestamp),
            ColumnSpec::nullable("temp_c", ColumnType::Float),
            ColumnSpec::nullable("wind_speed_kt", ColumnType::Float),
            ColumnSpec::nullable("wind_gust_kt", ColumnType::Float),
            ColumnSpec::nullable("visibility_statute_mi", ColumnType::Float),
            ColumnSpec::nullable("ceiling_ft_agl", ColumnType::Float),
            ColumnSpec::nullable("wx_string", ColumnType::Categorical),
            ColumnSpec::nullable("flight_category", ColumnType::Categorical),
        ],
        primary_key: vec!["station_id".to_string(), "observation_time".to_string()],
        date_column: "observation_time".to_string(),
    }
}

/// Parses the weather service's CSV response.
///
/// Status lines before the header row are skipped. Repeated headers (the
/// per-layer `sky_cover`/`cloud_base_ft_agl` pairs) get a `_2`, `_3` ...
/// suffix so tables from several stations can be merged by header name.
pub fn parse_metar_csv(text: &str) -> Result<RawTable, ConnectorError> {
    if text.trim().is_empty() {
        return Ok(RawTable::default());
    }
    let header_at = text
        .lines()
        .position(is_header_line)
        .ok_or_else(|| {
            ConnectorError::UpstreamSchemaChanged("metar response has no station_id header".to_string())
        })?;
    let body = text.lines().skip(header_at).collect::<Vec<_>>().join("\n");
    let mut table = read_csv(&body)?;
    disambiguate_headers(&mut table.headers);
    Ok(table)
}

fn is_header_line(line: &str) -> bool {
    line.split(',')
        .any(|cell| STATION.iter().any(|alias| cell.trim().eq_ignore_ascii_case(alias)))
}

fn disambiguate_headers(headers: &mut [String]) {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for header in headers.iter_mut() {
        let key = header.trim().to_ascii_lowercase();
        let count = seen.entry(key).or_insert(0);
        *count += 1;
        if *count > 1 {
            *header = format!("{}_{}", header.trim(), count);
        }
    }
}

/// Sky-cover/cloud-base column pairs, in layer order.
fn cloud_layers(table: &RawTable) -> Vec<(Option<usize>, usize)> {
    let mut layers = Vec::new();
    let mut last_cover = None;
    for (idx, header) in table.headers.iter().enumerate() {
        let name = header.trim().to_ascii_lowercase();
        if name.starts_with("sky_cover") {
            last_cover = Some(idx);
        } else if name.starts_with("cloud_base_ft_agl") {
            layers.push((last_cover.take(), idx));
        }
    }
    layers
}

/// Lowest broken-or-worse layer base. Layers with no sky cover column
/// alongside them count unconditionally.
fn ceiling_from_layers(row: &[String], layers: &[(Option<usize>, usize)]) -> Result<Option<f64>, String> {
    let mut ceiling: Option<f64> = None;
    for &(cover, base) in layers {
        if let Some(cover) = cover {
            let cover = field(row, Some(cover)).trim().to_ascii_uppercase();
            if !CEILING_COVERS.contains(&cover.as_str()) {
                continue;
            }
        }
        if let Some(height) =
            parse::optional_f64(field(row, Some(base))).map_err(|e| format!("cloud_base_ft_agl: {e}"))?
        {
            ceiling = Some(ceiling.map_or(height, |c: f64| c.min(height)));
        }
    }
    Ok(ceiling)
}

fn fahrenheit_to_celsius(f: f64) -> f64 {
    parse::round2((f - 32.0) * 5.0 / 9.0)
}

#[derive(Debug, Clone)]
pub struct MetarConnector {
    base_url: String,
    user_agent: Option<String>,
}

impl MetarConnector {
    pub fn new(base_url: impl Into<String>, user_agent: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent,
        }
    }

    pub fn from_settings(settings: &ConnectorSettings) -> Self {
        Self::new(
            settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_METAR_URL.to_string()),
            settings.user_agent.clone(),
        )
    }

    fn station_request(&self, params: &RequestParams, station: &str) -> HttpRequest {
        let mut request = HttpRequest::get(&self.base_url)
            .query("dataSource", "metars")
            .query("requestType", "retrieve")
            .query("format", "csv")
            .query("stationString", station)
            .query("startTime", format!("{}T00:00:00Z", params.range.start()))
            .query("endTime", format!("{}T23:59:59Z", params.range.end()));
        if let Some(user_agent) = &self.user_agent {
            request = request.header("User-Agent", user_agent.clone());
        }
        request
    }
}

#[async_trait]
impl SourceConnector for MetarConnector {
    fn source_id(&self) -> SourceId {
        SourceId::Metar
    }

    fn schema(&self) -> TableSchema {
        metar_schema()
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        params: &RequestParams,
    ) -> Result<RawBatch, ConnectorError> {
        if params.stations.is_empty() {
            return Err(ConnectorError::UpstreamUnavailable(
                "metar requests need at least one station".to_string(),
            ));
        }

        let mut table = RawTable::default();
        for station in &params.stations {
            let response = http
                .fetch(SourceId::Metar, &self.station_request(params, station))
                .await?;
            let station_table = parse_metar_csv(&response.text())?;
            debug!(station = %station, rows = station_table.len(), "metar station parsed");
            table.extend_from(station_table);
        }

        let time_idx = table.column_index_any(OBSERVATION_TIME);
        retain_in_range(&mut table, time_idx, params.range);
        let returned_range = observed_range(&table, time_idx);
        info!(rows = table.len(), stations = params.stations.len(), "metar fetch complete");

        let mut request_meta = BTreeMap::new();
        request_meta.insert("url".to_string(), self.base_url.clone());
        request_meta.insert("requests".to_string(), params.stations.len().to_string());
        request_meta.insert("stations".to_string(), params.stations.join(","));

        Ok(RawBatch {
            source_id: SourceId::Metar,
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
            return Ok(empty_table(batch, metar_schema()));
        }
        let mut columns = ColumnResolver::new(SourceId::Metar, table);
        let station = columns.require(STATION)?;
        let observed = columns.require(OBSERVATION_TIME)?;
        let temp_c = columns.find(&["temp_c"]);
        let temp_f = columns.find(&["temp_f"]);
        if temp_c.is_none() && temp_f.is_none() {
            columns.mark_missing("temp_c");
        }
        let wind_speed = columns.optional("wind_speed_kt", WIND_SPEED);
        let wind_gust = columns.optional("wind_gust_kt", WIND_GUST);
        let visibility = columns.find(VISIBILITY);
        let visibility_m = columns.find(&["visibility_m"]);
        if visibility.is_none() && visibility_m.is_none() {
            columns.mark_missing("visibility_statute_mi");
        }
        let ceiling = columns.find(&["ceiling_ft_agl", "ceiling"]);
        let layers = cloud_layers(table);
        for &(cover, base) in &layers {
            if let Some(cover) = cover {
                columns.claim(cover);
            }
            columns.claim(base);
        }
        if ceiling.is_none() && layers.is_empty() {
            columns.mark_missing("ceiling_ft_agl");
        }
        let wx_string = columns.optional("wx_string", WX_STRING);
        let flight_category = columns.optional("flight_category", &["flight_category"]);

        let normalized = normalize_rows(batch, metar_schema(), policy, |row| {
            let station_id = parse::required_text(field(row, Some(station)), "station_id", true)?;
            let observation_time = parse::timestamp(field(row, Some(observed)))?;

            let temp = match (temp_c, temp_f) {
                (Some(_), _) => parse::optional_f64(field(row, temp_c)),
                (None, Some(_)) => {
                    parse::optional_f64(field(row, temp_f)).map(|v| v.map(fahrenheit_to_celsius))
                }
                (None, None) => Ok(None),
            }
            .map_err(|e| format!("temp_c: {e}"))?;

            let visibility_mi = match (visibility, visibility_m) {
                (Some(_), _) => parse::optional_f64(field(row, visibility)),
                (None, Some(_)) => parse::optional_f64(field(row, visibility_m))
                    .map(|v| v.map(|m| parse::round2(m / METRES_PER_STATUTE_MILE))),
                (None, None) => Ok(None),
            }
            .map_err(|e| format!("visibility_statute_mi: {e}"))?;

            let ceiling_ft = match ceiling {
                Some(_) => parse::optional_f64(field(row, ceiling)).map_err(|e| format!("ceiling_ft_agl: {e}"))?,
                None => ceiling_from_layers(row, &layers)?,
            };

            Ok(vec![
                Cell::Text(station_id),
                Cell::Timestamp(observation_time),
                temp.map_or(Cell::Null, Cell::Float),
                parse::optional_f64(field(row, wind_speed))
                    .map_err(|e| format!("wind_speed_kt: {e}"))?
                    .map_or(Cell::Null, Cell::Float),
                parse::optional_f64(field(row, wind_gust))
                    .map_err(|e| format!("wind_gust_kt: {e}"))?
                    .map_or(Cell::Null, Cell::Float),
                visibility_mi.map_or(Cell::Null, Cell::Float),
                ceiling_ft.map_or(Cell::Null, Cell::Float),
                parse::optional_text(field(row, wx_string), false).map_or(Cell::Null, Cell::Text),
                parse::optional_text(field(row, flight_category), true).map_or(Cell::Null, Cell::Text),
            ])
        })?;
        Ok(columns.annotate(normalized))
    }

    fn daily_summary(&self, table: &NormalizedTable, _params: &RequestParams) -> Option<DailySummary> {
        Some(DailySummary {
            name: "wx_daily",
            table: daily_metar_features(table),
        })
    }
}
