//! Core types for FluxSeries

use crate::{Result, SeriesError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

const DB_NAME_PATTERN: &str = "^[-%+()$_a-zA-Z0-9]+$";

fn db_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DB_NAME_PATTERN).expect("valid database name pattern"))
}

/// Check that a database name is usable as a file name and not reserved.
pub fn validate_db_name(name: &str) -> Result<()> {
    if name.starts_with('_') {
        return Err(SeriesError::Validation(format!(
            "illegal database name {:?}: must begin with a letter",
            name
        )));
    }
    if !db_name_regex().is_match(name) {
        return Err(SeriesError::Validation(format!(
            "illegal database name {:?}",
            name
        )));
    }
    Ok(())
}

/// Parse a user-supplied time into UTC.
///
/// Accepts RFC 3339 with any offset and precision, `YYYY-MM-DD HH:MM:SS[.f]`,
/// bare dates, and integer epochs whose unit (s, ms, us, ns) is inferred from
/// magnitude. Fractional epochs are read as seconds.
pub fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return Err(SeriesError::InvalidKey("empty key".into()));
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t.and_utc());
        }
    }

    if let Ok(n) = s.parse::<i64>() {
        let abs = n.unsigned_abs();
        let nanos = if abs < 100_000_000_000 {
            n.checked_mul(1_000_000_000)
        } else if abs < 100_000_000_000_000 {
            n.checked_mul(1_000_000)
        } else if abs < 100_000_000_000_000_000 {
            n.checked_mul(1_000)
        } else {
            Some(n)
        };
        return nanos
            .map(|ns| Utc.timestamp_nanos(ns))
            .ok_or_else(|| SeriesError::InvalidKey(input.to_string()));
    }
    if let Ok(f) = s.parse::<f64>() {
        let ns = f * 1e9;
        if ns.is_finite() && ns.abs() < i64::MAX as f64 {
            return Ok(Utc.timestamp_nanos(ns as i64));
        }
    }

    Err(SeriesError::InvalidKey(input.to_string()))
}

/// Render a time as a document key: RFC 3339, UTC, fixed nine fractional
/// digits, so byte order equals time order.
pub fn format_key(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse any accepted time form and return its canonical key.
pub fn normalize_key(input: &str) -> Result<String> {
    parse_time(input).map(|t| format_key(&t))
}

/// Key for the current instant.
pub fn now_key() -> String {
    format_key(&Utc::now())
}

/// Nanoseconds since epoch of a stored document key.
pub fn key_timestamp(key: &str) -> Result<Timestamp> {
    parse_time(key)?
        .timestamp_nanos_opt()
        .ok_or_else(|| SeriesError::InvalidKey(key.to_string()))
}

/// Key for a nanosecond timestamp.
pub fn timestamp_key(ts: Timestamp) -> String {
    format_key(&Utc.timestamp_nanos(ts))
}

/// A value extracted from a document by JSON pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Pointer did not resolve, resolved to `null`, or the body was unreadable
    Absent,
    Text(String),
    Number(f64),
    /// Booleans, arrays and objects, passed through untouched
    Other(Value),
}

impl FieldValue {
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => FieldValue::Absent,
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Number(n) => n
                .as_f64()
                .map(FieldValue::Number)
                .unwrap_or_else(|| FieldValue::Text(n.to_string())),
            other => FieldValue::Other(other.clone()),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    /// Numeric reading: numbers directly, text when it parses as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(f) => Some(*f),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String form used for filter comparison. Only text and numbers have one.
    pub fn canonical(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(f) => Some(canonical_number(*f)),
            _ => None,
        }
    }

    /// Replace numbers with their canonical text so every reducer sees one
    /// representation regardless of how the document encoded the number.
    pub fn canonicalized(self) -> Self {
        match self {
            FieldValue::Number(f) => FieldValue::Text(canonical_number(f)),
            other => other,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Absent => Value::Null,
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Number(f) => Value::from(*f),
            FieldValue::Other(v) => v.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Absent => write!(f, "null"),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Number(n) => write!(f, "{}", canonical_number(*n)),
            FieldValue::Other(v) => write!(f, "{}", v),
        }
    }
}

/// Shortest round-trip decimal; integral values have no fraction.
pub fn canonical_number(f: f64) -> String {
    if f == 0.0 {
        return "0".to_string();
    }
    format!("{}", f)
}

/// Equality filter on a JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    pub pointer: String,
    pub value: String,
}

impl Filter {
    pub fn new(pointer: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_names() {
        assert!(validate_db_name("metrics-01").is_ok());
        assert!(validate_db_name("a(b)+c$%").is_ok());
        assert!(validate_db_name("_reserved").is_err());
        assert!(validate_db_name("has/slash").is_err());
        assert!(validate_db_name("").is_err());
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(
            normalize_key("2024-01-01T00:00:01Z").unwrap(),
            "2024-01-01T00:00:01.000000000Z"
        );
        assert_eq!(
            normalize_key("2024-01-01T02:00:00.5+02:00").unwrap(),
            "2024-01-01T00:00:00.500000000Z"
        );
        assert_eq!(
            normalize_key("2024-01-01").unwrap(),
            "2024-01-01T00:00:00.000000000Z"
        );
        assert!(matches!(
            normalize_key("yesterday"),
            Err(SeriesError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_epoch_units() {
        let secs = normalize_key("1700000000").unwrap();
        let millis = normalize_key("1700000000000").unwrap();
        let nanos = normalize_key("1700000000000000000").unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs, nanos);
        assert_eq!(key_timestamp(&secs).unwrap(), 1_700_000_000_000_000_000);
    }

    #[test]
    fn test_keys_sort_by_time() {
        let a = normalize_key("2024-01-01T00:00:00Z").unwrap();
        let b = normalize_key("2024-01-01T00:00:00.1Z").unwrap();
        let c = normalize_key("2024-01-01T00:00:00.25Z").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_field_value_canonical() {
        assert_eq!(FieldValue::Number(3.0).canonical().as_deref(), Some("3"));
        assert_eq!(FieldValue::Number(0.25).canonical().as_deref(), Some("0.25"));
        assert_eq!(FieldValue::Number(-0.0).canonical().as_deref(), Some("0"));
        assert_eq!(FieldValue::Other(Value::Bool(true)).canonical(), None);
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(7)).canonicalized(),
            FieldValue::Text("7".into())
        );
        assert_eq!(FieldValue::Text(" 2.5".into()).as_f64(), Some(2.5));
    }
}
