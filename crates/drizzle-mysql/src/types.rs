//! Conversion between wire cells and host values.
//!
//! Reading turns a text-protocol cell into a [`Value`] according to the
//! column's [`ColumnType`]; writing renders a bind [`Value`] as a SQL literal
//! for placeholder substitution.
//!
//! Dates cross the boundary in local calendar time. The local-to-UTC offset
//! is sampled once per row (or per rendered value) and normalized into the
//! half-open range `(-12h, +12h]`; both directions use the same rule, so a
//! date read and written back within one offset period round-trips.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use regex::Regex;

use drizzle_core::error::{PlaceholderError, PlaceholderErrorKind};
use drizzle_core::{ColumnInfo, Error, Result, Row, Value};

use crate::column::{ColumnDescriptor, ColumnType};
use crate::wire::RawRow;

const HALF_DAY: i32 = 12 * 60 * 60;
const DAY: i32 = 24 * 60 * 60;

/// Fold an offset in seconds into `(-12h, +12h]`.
pub fn normalize_offset(seconds: i32) -> i32 {
    let mut delta = seconds % DAY;
    if delta <= -HALF_DAY {
        delta += DAY;
    }
    if delta > HALF_DAY {
        delta -= DAY;
    }
    delta
}

/// Current local-to-UTC offset in seconds, normalized.
pub fn local_offset_seconds() -> i32 {
    normalize_offset(Local::now().offset().local_minus_utc())
}

fn time_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(-)?(\d+):([0-5]\d):([0-5]\d)(?:\.\d+)?$").ok())
        .as_ref()
}

/// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` as local time into UTC milliseconds.
///
/// Zero dates and anything else chrono rejects yield `None`.
pub fn parse_date(text: &str, offset_seconds: i32) -> Option<i64> {
    let text = text.trim();
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    let seconds = naive.and_utc().timestamp() - i64::from(offset_seconds);
    Some(seconds * 1000 + i64::from(naive.and_utc().timestamp_subsec_millis()))
}

/// Parse `[-]H+:MM:SS[.f]` into whole seconds.
pub fn parse_time(text: &str) -> Option<i64> {
    let caps = time_pattern()?.captures(text.trim())?;
    let hours: i64 = caps.get(2)?.as_str().parse().ok()?;
    let minutes: i64 = caps.get(3)?.as_str().parse().ok()?;
    let seconds: i64 = caps.get(4)?.as_str().parse().ok()?;
    let total = hours.checked_mul(3600)?.checked_add(minutes * 60 + seconds)?;
    Some(if caps.get(1).is_some() { -total } else { total })
}

/// Format UTC milliseconds as a local `YYYY-MM-DD HH:MM:SS`.
pub fn format_date(millis: i64, offset_seconds: i32) -> Option<String> {
    let seconds = millis.div_euclid(1000) + i64::from(offset_seconds);
    let local = DateTime::from_timestamp(seconds, 0)?.naive_utc();
    Some(local.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Format a signed number of seconds as `[-]HH:MM:SS`.
pub fn format_duration(seconds: i64) -> String {
    let sign = if seconds < 0 { "-" } else { "" };
    let total = seconds.unsigned_abs();
    format!(
        "{sign}{:02}:{:02}:{:02}",
        total / 3600,
        (total / 60) % 60,
        total % 60
    )
}

fn cast_int(column: &ColumnDescriptor, bytes: &[u8], text: &str) -> Value {
    if column.is_bit() {
        // BIT(n) arrives as big-endian bytes, not digits
        if bytes.len() <= 8 {
            let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            return Value::from_u64(value);
        }
        return Value::Text(text.to_string());
    }
    let trimmed = text.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Value::Int(v);
    }
    trimmed
        .parse::<u64>()
        .map_or_else(|_| Value::Text(text.to_string()), Value::from_u64)
}

/// Coerce one cell using an explicit local offset.
pub fn cast_cell_with_offset(
    column: &ColumnDescriptor,
    cell: Option<&[u8]>,
    cast: bool,
    offset_seconds: i32,
) -> Value {
    let Some(bytes) = cell else {
        return Value::Null;
    };
    let text = String::from_utf8_lossy(bytes);
    if !cast {
        return Value::Text(text.into_owned());
    }

    match column.column_type {
        ColumnType::Bool => Value::Bool(!(text.is_empty() || text == "0")),
        ColumnType::Int => cast_int(column, bytes, &text),
        ColumnType::Number => text
            .trim()
            .parse::<f64>()
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Number),
        ColumnType::Date | ColumnType::DateTime => parse_date(&text, offset_seconds)
            .map_or_else(|| Value::Text(text.into_owned()), Value::Date),
        ColumnType::Time => {
            parse_time(&text).map_or_else(|| Value::Text(text.into_owned()), Value::Duration)
        }
        ColumnType::Text => Value::Bytes(bytes.to_vec()),
        ColumnType::Set => Value::Array(
            text.split(',')
                .filter(|item| !item.is_empty())
                .map(|item| Value::Text(item.to_string()))
                .collect(),
        ),
        ColumnType::String => Value::Text(text.into_owned()),
    }
}

/// Coerce one cell. `None` is SQL NULL; `cast = false` yields raw text.
pub fn cast_cell(column: &ColumnDescriptor, cell: Option<&[u8]>, cast: bool) -> Value {
    cast_cell_with_offset(column, cell, cast, local_offset_seconds())
}

/// Column-name metadata shared by every row of one result.
pub fn column_info(columns: &[ColumnDescriptor]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ))
}

/// Coerce a whole raw row, sampling the local offset once.
pub fn cast_row(
    columns: &[ColumnDescriptor],
    info: &Arc<ColumnInfo>,
    raw: &RawRow,
    cast: bool,
) -> Row {
    let offset = local_offset_seconds();
    let values = columns
        .iter()
        .zip(raw)
        .map(|(column, cell)| cast_cell_with_offset(column, cell.as_deref(), cast, offset))
        .collect();
    Row::with_columns(Arc::clone(info), values)
}

fn unsupported(value: &Value) -> Error {
    Error::Placeholder(PlaceholderError {
        kind: PlaceholderErrorKind::UnsupportedValue,
        message: format!("Cannot bind a {} value", value.type_name()),
    })
}

fn render_into(
    out: &mut String,
    value: &Value,
    in_array: bool,
    escape: &dyn Fn(&str) -> String,
    offset_seconds: i32,
) -> Result<()> {
    match value {
        Value::Array(items) => {
            if !in_array {
                out.push('(');
            }
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(if matches!(item, Value::Array(_)) { "),(" } else { "," });
                }
                render_into(out, item, true, escape, offset_seconds)?;
            }
            if !in_array {
                out.push(')');
            }
        }
        Value::Date(millis) => {
            let formatted = format_date(*millis, offset_seconds).ok_or_else(|| unsupported(value))?;
            out.push('\'');
            out.push_str(&formatted);
            out.push('\'');
        }
        Value::Bool(b) => out.push(if *b { '1' } else { '0' }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Number(f) if f.is_finite() => out.push_str(&f.to_string()),
        Value::Text(s) => {
            out.push('\'');
            out.push_str(&escape(s));
            out.push('\'');
        }
        Value::Bytes(bytes) => {
            out.push_str("X'");
            for byte in bytes {
                out.push_str(&format!("{byte:02X}"));
            }
            out.push('\'');
        }
        Value::Null => out.push_str("NULL"),
        Value::Duration(seconds) => {
            out.push('\'');
            out.push_str(&format_duration(*seconds));
            out.push('\'');
        }
        Value::Number(_) | Value::Json(_) => return Err(unsupported(value)),
    }
    Ok(())
}

/// Render a bind value as a SQL literal using an explicit local offset.
pub fn render_value_with_offset(
    value: &Value,
    escape: &dyn Fn(&str) -> String,
    offset_seconds: i32,
) -> Result<String> {
    let mut out = String::new();
    render_into(&mut out, value, false, escape, offset_seconds)?;
    Ok(out)
}

/// Render a bind value as a SQL literal.
///
/// Text goes through `escape` and is single-quoted; arrays become
/// parenthesized lists (an array of arrays becomes `(a,b),(c,d)`).
pub fn render_value(value: &Value, escape: &dyn Fn(&str) -> String) -> Result<String> {
    render_value_with_offset(value, escape, local_offset_seconds())
}
