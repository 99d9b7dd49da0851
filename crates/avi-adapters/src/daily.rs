//! Airport-day rollups derived from accepted raw-grain tables.

use std::collections::{BTreeMap, BTreeSet};

use avi_core::{Cell, ColumnSpec, ColumnType, DateRange, NormalizedTable, TableSchema};
use chrono::NaiveDate;

use crate::otp::icao_to_iata;

const PRECIP_CODES: [&str; 3] = ["RA", "SN", "DZ"];
const THUNDER_CODE: &str = "TS";
const IFR_CATEGORIES: [&str; 2] = ["IFR", "LIFR"];

/// A derived table plus the file stem it is persisted under.
#[derive(Debug, Clone, PartialEq)]
pub struct DailySummary {
    pub name: &'static str,
    pub table: NormalizedTable,
}

pub fn otp_daily_schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnSpec::required("date", ColumnType::Date),
            ColumnSpec::required("airport", ColumnType::Identifier),
            ColumnSpec::required("dep_count", ColumnType::Integer),
            ColumnSpec::required("arr_count", ColumnType::Integer),
            ColumnSpec::required("movements", ColumnType::Integer),
        ],
        primary_key: vec!["airport".to_string(), "date".to_string()],
        date_column: "date".to_string(),
    }
}

pub fn metar_daily_schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnSpec::required("date", ColumnType::Date),
            ColumnSpec::required("airport", ColumnType::Identifier),
            ColumnSpec::nullable("wind_mean", ColumnType::Float),
            ColumnSpec::nullable("gust_max", ColumnType::Float),
            ColumnSpec::nullable("vis_min", ColumnType::Float),
            ColumnSpec::nullable("ceiling_min", ColumnType::Float),
            ColumnSpec::required("precip_any", ColumnType::Boolean),
            ColumnSpec::required("ts_any", ColumnType::Boolean),
            ColumnSpec::required("ifr_any", ColumnType::Boolean),
        ],
        primary_key: vec!["airport".to_string(), "date".to_string()],
        date_column: "date".to_string(),
    }
}

/// Departures, arrivals and total movements per airport and day.
///
/// `airports` are labels as requested (`KJFK`), matched against flights by
/// their IATA form. With no airports every observed code is counted.
/// Cancelled or diverted flights are excluded; a null flag counts as flown.
pub fn build_daily_movements(flights: &NormalizedTable, airports: &[String]) -> NormalizedTable {
    let idx = |name: &str| flights.schema.column_index(name);
    let (Some(date), Some(origin), Some(dest)) = (idx("flight_date"), idx("origin"), idx("dest")) else {
        return derived(flights, otp_daily_schema(), Vec::new());
    };
    let cancelled = idx("cancelled");
    let diverted = idx("diverted");

    let labels: Vec<(String, String)> = if airports.is_empty() {
        let observed = flights
            .rows
            .iter()
            .flat_map(|row| [text(row, origin), text(row, dest)])
            .flatten()
            .collect::<BTreeSet<_>>();
        observed.into_iter().map(|code| (code.to_string(), code.to_string())).collect()
    } else {
        airports.iter().map(|a| (a.clone(), icao_to_iata(a))).collect()
    };

    let mut counts: BTreeMap<(NaiveDate, String), (i64, i64)> = BTreeMap::new();
    for row in &flights.rows {
        if flag(row, cancelled) || flag(row, diverted) {
            continue;
        }
        let Some(day) = row.get(date).and_then(Cell::as_date) else {
            continue;
        };
        for (label, code) in &labels {
            let departs = text(row, origin) == Some(code.as_str());
            let arrives = text(row, dest) == Some(code.as_str());
            if departs || arrives {
                let slot = counts.entry((day, label.clone())).or_default();
                slot.0 += i64::from(departs);
                slot.1 += i64::from(arrives);
            }
        }
    }

    let rows = counts
        .into_iter()
        .map(|((day, airport), (dep, arr))| {
            vec![
                Cell::Date(day),
                Cell::Text(airport),
                Cell::Integer(dep),
                Cell::Integer(arr),
                Cell::Integer(dep + arr),
            ]
        })
        .collect();
    derived(flights, otp_daily_schema(), rows)
}

#[derive(Default)]
struct WeatherDay {
    wind_sum: f64,
    wind_n: usize,
    gust_max: Option<f64>,
    vis_min: Option<f64>,
    ceiling_min: Option<f64>,
    precip: bool,
    thunder: bool,
    ifr: bool,
}

/// Wind, visibility and ceiling extremes plus weather flags per station-day.
pub fn daily_metar_features(observations: &NormalizedTable) -> NormalizedTable {
    let idx = |name: &str| observations.schema.column_index(name);
    let (Some(station), Some(observed)) = (idx("station_id"), idx("observation_time")) else {
        return derived(observations, metar_daily_schema(), Vec::new());
    };
    let wind = idx("wind_speed_kt");
    let gust = idx("wind_gust_kt");
    let vis = idx("visibility_statute_mi");
    let ceiling = idx("ceiling_ft_agl");
    let wx = idx("wx_string");
    let category = idx("flight_category");

    let mut days: BTreeMap<(NaiveDate, String), WeatherDay> = BTreeMap::new();
    for row in &observations.rows {
        let (Some(day), Some(airport)) = (row.get(observed).and_then(Cell::as_date), text(row, station)) else {
            continue;
        };
        let acc = days.entry((day, airport.to_string())).or_default();
        if let Some(speed) = number(row, wind) {
            acc.wind_sum += speed;
            acc.wind_n += 1;
        }
        acc.gust_max = extreme(acc.gust_max, number(row, gust), f64::max);
        acc.vis_min = extreme(acc.vis_min, number(row, vis), f64::min);
        acc.ceiling_min = extreme(acc.ceiling_min, number(row, ceiling), f64::min);
        if let Some(codes) = wx.and_then(|i| text(row, i)).map(str::to_ascii_uppercase) {
            acc.precip |= PRECIP_CODES.iter().any(|c| codes.contains(c));
            acc.thunder |= codes.contains(THUNDER_CODE);
        }
        if let Some(cat) = category.and_then(|i| text(row, i)) {
            acc.ifr |= IFR_CATEGORIES.iter().any(|c| cat.eq_ignore_ascii_case(c));
        }
    }

    let float = |v: Option<f64>| v.map_or(Cell::Null, Cell::Float);
    let rows = days
        .into_iter()
        .map(|((day, airport), acc)| {
            let wind_mean = (acc.wind_n > 0).then(|| acc.wind_sum / acc.wind_n as f64);
            vec![
                Cell::Date(day),
                Cell::Text(airport),
                float(wind_mean),
                float(acc.gust_max),
                float(acc.vis_min),
                float(acc.ceiling_min),
                Cell::Boolean(acc.precip),
                Cell::Boolean(acc.thunder),
                Cell::Boolean(acc.ifr),
            ]
        })
        .collect();
    derived(observations, metar_daily_schema(), rows)
}

fn derived(source: &NormalizedTable, schema: TableSchema, rows: Vec<Vec<Cell>>) -> NormalizedTable {
    let returned_range = DateRange::spanning(rows.iter().filter_map(|r| r.first().and_then(Cell::as_date)));
    NormalizedTable {
        source_id: source.source_id,
        schema,
        rows,
        requested_range: source.requested_range,
        returned_range,
        dropped_rows: Vec::new(),
        missing_columns: Vec::new(),
        extra_columns: Vec::new(),
    }
}

fn text(row: &[Cell], idx: usize) -> Option<&str> {
    row.get(idx).and_then(Cell::as_text)
}

fn number(row: &[Cell], idx: Option<usize>) -> Option<f64> {
    idx.and_then(|i| row.get(i)).and_then(Cell::as_f64)
}

fn flag(row: &[Cell], idx: Option<usize>) -> bool {
    matches!(idx.and_then(|i| row.get(i)), Some(Cell::Boolean(true)))
}

fn extreme(current: Option<f64>, next: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (current, next) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metar_schema, otp_schema};
    use avi_core::SourceId;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    fn table(source_id: SourceId, schema: TableSchema, rows: Vec<Vec<Cell>>) -> NormalizedTable {
        NormalizedTable {
            source_id,
            schema,
            rows,
            requested_range: DateRange::new(day(1), day(2)).unwrap(),
            returned_range: None,
            dropped_rows: Vec::new(),
            missing_columns: Vec::new(),
            extra_columns: Vec::new(),
        }
    }

    fn flight(d: u32, number: &str, origin: &str, dest: &str, cancelled: Cell, diverted: bool) -> Vec<Cell> {
        vec![
            Cell::Date(day(d)),
            Cell::Text("AA".to_string()),
            Cell::Text(number.to_string()),
            Cell::Text(origin.to_string()),
            Cell::Text(dest.to_string()),
            Cell::Null,
            Cell::Null,
            cancelled,
            Cell::Boolean(diverted),
        ]
    }

    fn obs(hour: u32, d: u32, wind: f64, gust: Cell, vis: f64, ceiling: Cell, wx: Cell, cat: &str) -> Vec<Cell> {
        vec![
            Cell::Text("KJFK".to_string()),
            Cell::Timestamp(Utc.with_ymd_and_hms(2023, 1, d, hour, 51, 0).single().unwrap()),
            Cell::Float(5.0),
            Cell::Float(wind),
            gust,
            Cell::Float(vis),
            ceiling,
            wx,
            Cell::Text(cat.to_string()),
        ]
    }

    #[test]
    fn movements_count_both_directions_and_skip_cancelled_or_diverted() {
        let flights = table(
            SourceId::Otp,
            otp_schema(),
            vec![
                flight(1, "1", "JFK", "LAX", Cell::Boolean(false), false),
                flight(1, "2", "ATL", "JFK", Cell::Boolean(false), false),
                flight(1, "3", "JFK", "BOS", Cell::Boolean(true), false),
                flight(1, "4", "ORD", "JFK", Cell::Boolean(false), true),
                flight(2, "5", "JFK", "SFO", Cell::Null, false),
                flight(2, "6", "LAX", "SFO", Cell::Boolean(false), false),
            ],
        );
        let daily = build_daily_movements(&flights, &["KJFK".to_string()]);

        assert_eq!(daily.schema, otp_daily_schema());
        assert_eq!(
            daily.rows,
            vec![
                vec![
                    Cell::Date(day(1)),
                    Cell::Text("KJFK".to_string()),
                    Cell::Integer(1),
                    Cell::Integer(1),
                    Cell::Integer(2),
                ],
                vec![
                    Cell::Date(day(2)),
                    Cell::Text("KJFK".to_string()),
                    Cell::Integer(1),
                    Cell::Integer(0),
                    Cell::Integer(1),
                ],
            ]
        );
        assert_eq!(daily.returned_range, Some(DateRange::new(day(1), day(2)).unwrap()));
    }

    #[test]
    fn movements_without_airports_cover_every_observed_code() {
        let flights = table(
            SourceId::Otp,
            otp_schema(),
            vec![flight(1, "1", "JFK", "LAX", Cell::Boolean(false), false)],
        );
        let daily = build_daily_movements(&flights, &[]);
        let airports = daily
            .column_values("airport")
            .unwrap()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert_eq!(airports, vec!["JFK", "LAX"]);
        assert_eq!(daily.rows[1][3], Cell::Integer(1));
    }

    #[test]
    fn weather_features_roll_up_per_station_day() {
        let text = |v: &str| Cell::Text(v.to_string());
        let observations = table(
            SourceId::Metar,
            metar_schema(),
            vec![
                obs(0, 1, 9.0, Cell::Null, 10.0, Cell::Null, Cell::Null, "VFR"),
                obs(1, 1, 12.0, Cell::Float(20.0), 3.0, Cell::Float(800.0), text("-ra BR"), "IFR"),
                obs(2, 1, 15.0, Cell::Float(25.0), 5.0, Cell::Float(1500.0), text("VCTS"), "MVFR"),
                obs(0, 2, 14.0, Cell::Null, 10.0, Cell::Null, text("BR"), "VFR"),
            ],
        );
        let daily = daily_metar_features(&observations);

        assert_eq!(daily.row_count(), 2);
        assert_eq!(
            daily.rows[0],
            vec![
                Cell::Date(day(1)),
                Cell::Text("KJFK".to_string()),
                Cell::Float(12.0),
                Cell::Float(25.0),
                Cell::Float(3.0),
                Cell::Float(800.0),
                Cell::Boolean(true),
                Cell::Boolean(true),
                Cell::Boolean(true),
            ]
        );
        let second = &daily.rows[1];
        assert_eq!(second[3], Cell::Null);
        assert_eq!(second[5], Cell::Null);
        assert_eq!(&second[6..], &[Cell::Boolean(false), Cell::Boolean(false), Cell::Boolean(false)]);
    }

    #[test]
    fn empty_inputs_give_empty_rollups() {
        let flights = table(SourceId::Otp, otp_schema(), Vec::new());
        assert!(build_daily_movements(&flights, &["KJFK".to_string()]).is_empty());
        let observations = table(SourceId::Metar, metar_schema(), Vec::new());
        let daily = daily_metar_features(&observations);
        assert!(daily.is_empty());
        assert_eq!(daily.schema, metar_daily_schema());
    }
}
