use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use avi_adapters::{
    connector_for_source, parse_metar_csv, parse_otp_page, parse_tsa_csv, ConnectorSettings,
    NormalizeError,
};
use avi_core::{Cell, DateRange, MalformedRowPolicy, RawBatch, RawTable, RequestParams, SourceId};
use chrono::{NaiveDate, TimeZone, Utc};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(rel: &str) -> String {
    let path = workspace_root().join("fixtures").join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn batch(source_id: SourceId, table: RawTable, stations: &[&str]) -> RawBatch {
    let range = DateRange::new(day(2023, 1, 1), day(2023, 1, 2)).unwrap();
    RawBatch {
        source_id,
        params: RequestParams::new(source_id, range, stations.iter().copied()),
        requested_range: range,
        returned_range: Some(range),
        fetched_at: Utc.with_ymd_and_hms(2023, 1, 3, 6, 0, 0).single().unwrap(),
        request_meta: BTreeMap::new(),
        table,
    }
}

fn otp_batch() -> RawBatch {
    let (table, next_page) = parse_otp_page(fixture("otp/page_1.json").as_bytes()).unwrap();
    assert_eq!(next_page, None);
    batch(SourceId::Otp, table, &["KJFK"])
}

#[test]
fn otp_fixture_normalizes_with_drop_policy() {
    let connector = connector_for_source(SourceId::Otp, &ConnectorSettings::default());
    let table = connector
        .normalize(&otp_batch(), MalformedRowPolicy::Drop)
        .expect("normalize");

    assert_eq!(table.row_count(), 4);
    assert_eq!(table.dropped_rows.len(), 1);
    assert_eq!(table.dropped_rows[0].row, 2);
    assert!(table.dropped_rows[0].reason.contains("carrier"));

    let carriers = table
        .column_values("carrier")
        .unwrap()
        .map(|c| c.to_string())
        .collect::<Vec<_>>();
    assert_eq!(carriers, vec!["AA", "DL", "B6", "UA"]);
    let first = &table.rows[0];
    assert_eq!(first[0], Cell::Date(day(2023, 1, 1)));
    assert_eq!(first[2], Cell::Text("100".to_string()));
    assert_eq!(first[5], Cell::Float(-3.0));
    assert_eq!(first[7], Cell::Boolean(false));

    let cancelled = &table.rows[2];
    assert_eq!(cancelled[5], Cell::Null);
    assert_eq!(cancelled[7], Cell::Boolean(true));
    assert_eq!(table.rows[1][3], Cell::Text("JFK".to_string()));
}

#[test]
fn otp_partial_headers_record_missing_and_extra_columns() {
    let mut raw = RawTable::new(
        ["FlightDate", "Reporting_Airline", "Flight_Number_Reporting_Airline", "Origin", "Dest", "NewThing"]
            .iter()
            .map(|h| h.to_string())
            .collect(),
    );
    raw.rows.push(
        ["2023-01-01", "AA", "0100", "JFK", "LAX", "surprise"]
            .iter()
            .map(|v| v.to_string())
            .collect(),
    );
    let connector = connector_for_source(SourceId::Otp, &ConnectorSettings::default());
    let table = connector
        .normalize(&batch(SourceId::Otp, raw, &["KJFK"]), MalformedRowPolicy::Abort)
        .unwrap();

    assert_eq!(table.row_count(), 1);
    assert_eq!(
        table.missing_columns,
        vec!["dep_delay_min", "arr_delay_min", "cancelled", "diverted"]
    );
    assert_eq!(table.extra_columns, vec!["NewThing"]);
    assert_eq!(table.rows[0][5], Cell::Null);
}

#[test]
fn complete_fixtures_have_no_missing_columns() {
    let otp = connector_for_source(SourceId::Otp, &ConnectorSettings::default())
        .normalize(&otp_batch(), MalformedRowPolicy::Drop)
        .unwrap();
    assert!(otp.missing_columns.is_empty());
    assert!(otp.extra_columns.is_empty());

    let raw = parse_metar_csv(&fixture("metar/kjfk.csv")).unwrap();
    let metar = connector_for_source(SourceId::Metar, &ConnectorSettings::default())
        .normalize(&batch(SourceId::Metar, raw, &["KJFK"]), MalformedRowPolicy::Drop)
        .unwrap();
    assert!(metar.missing_columns.is_empty());
    // layer columns feed the ceiling, the rest has no canonical home
    assert_eq!(metar.extra_columns, vec!["raw_text", "dewpoint_c", "wind_dir_degrees"]);

    let raw = parse_tsa_csv(&fixture("tsa/tsa_travel_numbers.csv")).unwrap();
    let tsa = connector_for_source(SourceId::Tsa, &ConnectorSettings::default())
        .normalize(&batch(SourceId::Tsa, raw, &[]), MalformedRowPolicy::Abort)
        .unwrap();
    assert!(tsa.missing_columns.is_empty());
    assert!(tsa.extra_columns.is_empty());
}

#[test]
fn otp_abort_policy_reports_the_first_bad_row() {
    let connector = connector_for_source(SourceId::Otp, &ConnectorSettings::default());
    let err = connector
        .normalize(&otp_batch(), MalformedRowPolicy::Abort)
        .unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedRecord { row: 2, .. }));
}

#[test]
fn normalization_is_byte_for_byte_deterministic() {
    for (source_id, raw) in [
        (SourceId::Otp, otp_batch()),
        (
            SourceId::Metar,
            batch(SourceId::Metar, parse_metar_csv(&fixture("metar/kjfk.csv")).unwrap(), &["KJFK"]),
        ),
        (
            SourceId::Tsa,
            batch(SourceId::Tsa, parse_tsa_csv(&fixture("tsa/tsa_travel_numbers.csv")).unwrap(), &[]),
        ),
    ] {
        let connector = connector_for_source(source_id, &ConnectorSettings::default());
        let first = connector.normalize(&raw, MalformedRowPolicy::Drop).unwrap();
        let second = connector.normalize(&raw, MalformedRowPolicy::Drop).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap(),
            "{source_id} normalization drifted between runs"
        );
    }
}

#[test]
fn metar_fixture_derives_ceiling_and_visibility() {
    let raw = parse_metar_csv(&fixture("metar/kjfk.csv")).unwrap();
    let connector = connector_for_source(SourceId::Metar, &ConnectorSettings::default());
    let table = connector
        .normalize(&batch(SourceId::Metar, raw, &["KJFK"]), MalformedRowPolicy::Drop)
        .unwrap();

    assert_eq!(table.row_count(), 4);
    assert!(table.dropped_rows.is_empty());

    let schema = &table.schema;
    let vis = schema.column_index("visibility_statute_mi").unwrap();
    let ceiling = schema.column_index("ceiling_ft_agl").unwrap();
    let category = schema.column_index("flight_category").unwrap();
    let wx = schema.column_index("wx_string").unwrap();
    let gust = schema.column_index("wind_gust_kt").unwrap();

    assert_eq!(table.rows[0][vis], Cell::Float(10.0));
    assert_eq!(table.rows[0][ceiling], Cell::Null);
    assert_eq!(table.rows[0][category], Cell::Text("VFR".to_string()));
    assert_eq!(table.rows[0][wx], Cell::Null);
    assert_eq!(table.rows[0][gust], Cell::Null);

    assert_eq!(table.rows[1][ceiling], Cell::Float(800.0));
    assert_eq!(table.rows[1][wx], Cell::Text("-RA BR".to_string()));
    assert_eq!(table.rows[1][gust], Cell::Float(20.0));
    assert_eq!(table.rows[2][ceiling], Cell::Null);
    assert_eq!(
        table.rows[1][1],
        Cell::Timestamp(Utc.with_ymd_and_hms(2023, 1, 1, 1, 51, 0).single().unwrap())
    );
}

#[test]
fn metar_unit_conversions_apply_when_only_raw_units_exist() {
    let raw = parse_metar_csv(
        "station,observation_time,temp_f,visibility_m\nkjfk,2023-01-01 00:51,50,16093.44\n",
    )
    .unwrap();
    let connector = connector_for_source(SourceId::Metar, &ConnectorSettings::default());
    let table = connector
        .normalize(&batch(SourceId::Metar, raw, &["KJFK"]), MalformedRowPolicy::Abort)
        .unwrap();
    let row = &table.rows[0];
    assert_eq!(row[0], Cell::Text("KJFK".to_string()));
    assert_eq!(row[2], Cell::Float(10.0));
    assert_eq!(row[5], Cell::Float(10.0));
}

#[test]
fn metar_without_timestamps_is_a_missing_column() {
    let raw = parse_metar_csv("station_id,temp_c\nKJFK,4.0\n").unwrap();
    let connector = connector_for_source(SourceId::Metar, &ConnectorSettings::default());
    let err = connector
        .normalize(&batch(SourceId::Metar, raw, &["KJFK"]), MalformedRowPolicy::Drop)
        .unwrap_err();
    assert!(matches!(err, NormalizeError::MissingColumn { source_id: SourceId::Metar, .. }));
}

#[test]
fn tsa_fixture_defaults_checkpoint_and_parses_separators() {
    let raw = parse_tsa_csv(&fixture("tsa/tsa_travel_numbers.csv")).unwrap();
    let connector = connector_for_source(SourceId::Tsa, &ConnectorSettings::default());
    let table = connector
        .normalize(&batch(SourceId::Tsa, raw, &[]), MalformedRowPolicy::Abort)
        .unwrap();

    assert_eq!(table.row_count(), 4);
    assert_eq!(
        table.rows[0],
        vec![
            Cell::Date(day(2023, 1, 3)),
            Cell::Text("NATIONAL".to_string()),
            Cell::Integer(2_153_427),
        ]
    );
}

#[test]
fn tsa_abort_policy_stops_on_unparseable_counts() {
    let raw = parse_tsa_csv("date,travelers\n2023-01-01,100\n2023-01-02,lots\n").unwrap();
    let connector = connector_for_source(SourceId::Tsa, &ConnectorSettings::default());
    let err = connector
        .normalize(&batch(SourceId::Tsa, raw.clone(), &[]), MalformedRowPolicy::Abort)
        .unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedRecord { row: 1, .. }));

    let dropped = connector
        .normalize(&batch(SourceId::Tsa, raw, &[]), MalformedRowPolicy::Drop)
        .unwrap();
    assert_eq!(dropped.row_count(), 1);
    assert_eq!(dropped.dropped_rows.len(), 1);
}

#[test]
fn empty_batches_normalize_to_empty_tables() {
    for source_id in SourceId::ALL {
        let connector = connector_for_source(source_id, &ConnectorSettings::default());
        let table = connector
            .normalize(&batch(source_id, RawTable::default(), &[]), MalformedRowPolicy::Abort)
            .unwrap();
        assert!(table.is_empty());
        assert_eq!(table.schema, connector.schema());
    }
}
