//! Scalar coercion and per-element decoders

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::{Decoded, ScalarType};
use crate::source::SourceValue;

/// Day number of 1970-01-01 in the spreadsheet epoch (1899-12-30 based)
pub const EXCEL_UNIX_EPOCH_DAY: f64 = 25569.0;

/// Legacy stores write this in date columns that have no value
pub const EXCEL_NULL_SENTINEL: f64 = 1e30;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Coerce a raw value to its declared scalar type
pub fn ensure_type(scalar: &ScalarType, value: &SourceValue) -> Decoded {
    if value.is_null() {
        return Decoded::Value(Value::Null);
    }

    match scalar {
        ScalarType::Object => Decoded::Degraded {
            value: Value::Null,
            diagnostic: "declared type 'object' has no transform mapping".to_string(),
        },
        ScalarType::String => Decoded::Value(Value::String(strip_control(&as_text(value)))),
        ScalarType::Number => Decoded::Value(to_number(value)),
        ScalarType::Date => Decoded::Value(to_iso_date(value)),
        ScalarType::Other(name) => Decoded::Degraded {
            value: Value::Null,
            diagnostic: format!("no coercion for declared type '{}'", name),
        },
    }
}

/// Text form of any raw value, used before string-level processing
pub(crate) fn as_text(value: &SourceValue) -> String {
    match value {
        SourceValue::Text(s) => s.clone(),
        SourceValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        other => other.key_text(),
    }
}

/// Remove C0 and C1 control characters
pub fn strip_control(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(*c as u32, 0x00..=0x1F | 0x7F..=0x9F))
        .collect()
}

fn to_number(value: &SourceValue) -> Value {
    let n = match value {
        SourceValue::Int(i) => Some(*i as f64),
        SourceValue::Float(f) => Some(*f),
        SourceValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        SourceValue::Text(s) => parse_number(s),
        SourceValue::Null | SourceValue::Bytes(_) => None,
    };
    n.and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| !n.is_nan())
}

fn to_iso_date(value: &SourceValue) -> Value {
    let text = as_text(value);
    parse_iso(text.trim()).map(Value::String).unwrap_or(Value::Null)
}

/// Parse an ISO-8601 date or datetime and render it in canonical
/// `YYYY-MM-DDTHH:MM:SS[.ffffff][+HH:MM]` form.
pub fn parse_iso(s: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(format!("{}{}", render_naive(&dt.naive_local()), dt.format("%:z")));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(render_naive(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| render_naive(&naive))
}

fn render_naive(naive: &NaiveDateTime) -> String {
    let micros = naive.and_utc().timestamp_subsec_micros();
    if micros == 0 {
        naive.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        format!("{}.{:06}", naive.format("%Y-%m-%dT%H:%M:%S"), micros)
    }
}

fn excel_sentinel() -> &'static Regex {
    static SENTINEL: OnceLock<Regex> = OnceLock::new();
    SENTINEL.get_or_init(|| {
        Regex::new(r"(?i)^[+-]?1(\.0*)?e\+?30$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Convert a spreadsheet day number to an ISO datetime string.
///
/// Day 25569 is 1970-01-01T00:00:00. The `1e30` sentinel and anything that
/// is not a number come back as null.
pub fn excel_date(value: &SourceValue) -> Value {
    let days = match value {
        SourceValue::Int(i) => Some(*i as f64),
        SourceValue::Float(f) => Some(*f),
        SourceValue::Text(s) => {
            let trimmed = s.trim();
            if excel_sentinel().is_match(trimmed) {
                return Value::Null;
            }
            parse_number(trimmed)
        },
        _ => None,
    };

    days.and_then(excel_days_to_iso)
        .map(Value::String)
        .unwrap_or(Value::Null)
}

pub(crate) fn excel_days_to_iso(days: f64) -> Option<String> {
    if !days.is_finite() || days.abs() >= EXCEL_NULL_SENTINEL {
        return None;
    }
    let seconds = ((days - EXCEL_UNIX_EPOCH_DAY) * SECONDS_PER_DAY).round() as i64;
    DateTime::from_timestamp(seconds, 0).map(|dt| render_naive(&dt.naive_utc()))
}

/// Undo text that was stored as UTF-8 bytes but read back one byte per
/// character. Strings that do not round-trip are returned unchanged.
pub fn repair_text(s: &str) -> String {
    let reinterpreted: Option<Vec<u8>> = s
        .chars()
        .map(|c| u8::try_from(c as u32).ok())
        .collect();

    let repaired = reinterpreted
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| s.to_string());
    strip_control(&repaired)
}
