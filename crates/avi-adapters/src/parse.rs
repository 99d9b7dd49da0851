//! Cell coercions shared by the normalizers. Every function takes the raw
//! string as read from the upstream and reports failures as a short reason.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Markers upstreams use for "no value".
const MISSING_MARKERS: [&str; 5] = ["", "na", "n/a", "null", "m"];

fn is_missing(raw: &str) -> bool {
    let trimmed = raw.trim();
    MISSING_MARKERS
        .iter()
        .any(|marker| trimmed.eq_ignore_ascii_case(marker))
}

/// ISO `YYYY-MM-DD` (optionally followed by a time part) or US `M/D/YYYY`.
pub fn date(raw: &str) -> Result<NaiveDate, String> {
    let trimmed = raw.trim();
    let head = trimmed
        .split(|c| c == 'T' || c == ' ')
        .next()
        .unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%m/%d/%Y"))
        .map_err(|_| format!("unparseable date `{trimmed}`"))
}

/// RFC 3339, or a naive `YYYY-MM-DD[T ]HH:MM[:SS]` taken as UTC.
pub fn timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("unparseable timestamp `{trimmed}`"))
}

/// Optional decimal. Thousands separators and a trailing `+` (as in METAR
/// visibility `10+`) are accepted.
pub fn optional_f64(raw: &str) -> Result<Option<f64>, String> {
    if is_missing(raw) {
        return Ok(None);
    }
    let cleaned = raw.trim().trim_end_matches('+').replace(',', "");
    let value = cleaned
        .parse::<f64>()
        .map_err(|_| format!("unparseable number `{}`", raw.trim()))?;
    if !value.is_finite() {
        return Err(format!("non-finite number `{}`", raw.trim()));
    }
    Ok(Some(value))
}

/// Optional whole number; `1,234` and `1234.0` are accepted, `12.5` is not.
pub fn optional_count(raw: &str) -> Result<Option<i64>, String> {
    if is_missing(raw) {
        return Ok(None);
    }
    let cleaned = raw.trim().replace(',', "");
    if let Ok(value) = cleaned.parse::<i64>() {
        return Ok(Some(value));
    }
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 => {
            // i64::MAX rounds up to 2^63 as f64, hence the exclusive upper bound
            if value >= i64::MIN as f64 && value < i64::MAX as f64 {
                Ok(Some(value as i64))
            } else {
                Err("count out of range".to_string())
            }
        }
        _ => Err(format!("unparseable count `{}`", raw.trim())),
    }
}

/// `0`/`1` (also as `0.00`/`1.00`), `true`/`false`, `yes`/`no`.
pub fn optional_flag(raw: &str) -> Result<Option<bool>, String> {
    if is_missing(raw) {
        return Ok(None);
    }
    let lower = raw.trim().to_ascii_lowercase();
    match lower.as_str() {
        "true" | "yes" | "y" => return Ok(Some(true)),
        "false" | "no" | "n" => return Ok(Some(false)),
        _ => {}
    }
    match lower.parse::<f64>() {
        Ok(v) if v == 0.0 => Ok(Some(false)),
        Ok(v) if v == 1.0 => Ok(Some(true)),
        _ => Err(format!("unparseable flag `{}`", raw.trim())),
    }
}

/// Non-empty trimmed text, upper-cased when `upper` is set.
pub fn required_text(raw: &str, field: &str, upper: bool) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(format!("empty {field}"));
    }
    Ok(if upper {
        trimmed.to_ascii_uppercase()
    } else {
        trimmed.to_string()
    })
}

pub fn optional_text(raw: &str, upper: bool) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else if upper {
        Some(trimmed.to_ascii_uppercase())
    } else {
        Some(trimmed.to_string())
    }
}

/// Rounds converted units to two decimals so repeated runs agree bit-for-bit.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dates_accept_iso_and_us_forms() {
        let expected = NaiveDate::from_ymd_opt(2023, 1, 5).unwrap();
        assert_eq!(date("2023-01-05"), Ok(expected));
        assert_eq!(date(" 1/5/2023 "), Ok(expected));
        assert_eq!(date("2023-01-05T00:00:00"), Ok(expected));
        assert!(date("05.01.2023").is_err());
    }

    #[test]
    fn timestamps_default_to_utc() {
        let expected = Utc.with_ymd_and_hms(2023, 1, 1, 0, 51, 0).single().unwrap();
        assert_eq!(timestamp("2023-01-01T00:51:00Z"), Ok(expected));
        assert_eq!(timestamp("2023-01-01 00:51"), Ok(expected));
        assert_eq!(timestamp("2023-01-01T01:51:00+01:00"), Ok(expected));
        assert!(timestamp("yesterday").is_err());
    }

    #[test]
    fn numbers_handle_missing_markers_and_separators() {
        assert_eq!(optional_f64(""), Ok(None));
        assert_eq!(optional_f64("M"), Ok(None));
        assert_eq!(optional_f64("10+"), Ok(Some(10.0)));
        assert_eq!(optional_f64("1,500.5"), Ok(Some(1500.5)));
        assert!(optional_f64("NaN").is_err());
        assert!(optional_f64("calm").is_err());
    }

    #[test]
    fn counts_reject_fractions() {
        assert_eq!(optional_count("2,345,678"), Ok(Some(2_345_678)));
        assert_eq!(optional_count("-5"), Ok(Some(-5)));
        assert_eq!(optional_count("42.0"), Ok(Some(42)));
        assert!(optional_count("12.5").is_err());
        assert_eq!(optional_count("99999999999999999999"), Err("count out of range".to_string()));
        assert_eq!(optional_count("-1e19"), Err("count out of range".to_string()));
        assert_eq!(optional_count("9223372036854775807"), Ok(Some(i64::MAX)));
    }

    #[test]
    fn flags_accept_bts_decimal_encoding() {
        assert_eq!(optional_flag("0.00"), Ok(Some(false)));
        assert_eq!(optional_flag("1.00"), Ok(Some(true)));
        assert_eq!(optional_flag("TRUE"), Ok(Some(true)));
        assert_eq!(optional_flag(""), Ok(None));
        assert!(optional_flag("2").is_err());
    }
}
