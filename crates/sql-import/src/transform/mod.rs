//! Value transforms applied per field rule.
//!
//! Every transform is a pure function of the source value and the
//! [`TransformContext`]. NULL stays NULL for every kind except `string`,
//! which yields an empty string.
//!
//! Policies:
//!
//! - `bool` accepts booleans, numbers (non-zero is true) and the strings
//!   `1`, `0`, `true`, `false`, `y`, `n` (trimmed, case-insensitive).
//! - `int` rejects non-integral input rather than truncating it.
//! - `date` drops the time of day.
//! - `datetime` interprets naive timestamps in the source server's UTC
//!   offset (UTC unless configured) and produces an absolute timestamp.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::core::Value;
use crate::error::{ImportError, Result};

/// Transform applied to a source value before it is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Pass the value through unchanged.
    #[default]
    Direct,
    /// Stringify.
    #[serde(alias = "str")]
    String,
    Bool,
    Int,
    Float,
    Date,
    Datetime,
}

impl TransformKind {
    pub const ALL: [TransformKind; 7] = [
        TransformKind::Direct,
        TransformKind::String,
        TransformKind::Bool,
        TransformKind::Int,
        TransformKind::Float,
        TransformKind::Date,
        TransformKind::Datetime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Direct => "direct",
            TransformKind::String => "string",
            TransformKind::Bool => "bool",
            TransformKind::Int => "int",
            TransformKind::Float => "float",
            TransformKind::Date => "date",
            TransformKind::Datetime => "datetime",
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformKind {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(TransformKind::Direct),
            "string" | "str" => Ok(TransformKind::String),
            "bool" => Ok(TransformKind::Bool),
            "int" => Ok(TransformKind::Int),
            "float" => Ok(TransformKind::Float),
            "date" => Ok(TransformKind::Date),
            "datetime" => Ok(TransformKind::Datetime),
            other => Err(ImportError::Config(format!(
                "Unknown transform '{}'. Valid transforms: {}",
                other,
                TransformKind::ALL.map(|k| k.as_str()).join(", ")
            ))),
        }
    }
}

/// Settings that make transforms deterministic across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformContext {
    /// UTC offset of the source server's local time.
    pub source_offset: FixedOffset,
}

impl Default for TransformContext {
    fn default() -> Self {
        Self {
            source_offset: Utc.fix(),
        }
    }
}

impl TransformContext {
    /// Build a context from an offset in minutes east of UTC.
    pub fn with_offset_minutes(minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
            ImportError::Config(format!("Invalid source UTC offset: {} minutes", minutes))
        })?;
        Ok(Self {
            source_offset: offset,
        })
    }
}

/// Text layouts accepted for timestamps without zone.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    // SQL Server's default conversion style, e.g. "Jan 5 2024 10:30AM".
    "%b %e %Y %l:%M%p",
    "%b %e %Y %l:%M:%S%p",
];

/// Text layouts accepted for dates.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%b %e %Y"];

/// Applies transforms with a fixed context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformEngine {
    ctx: TransformContext,
}

impl TransformEngine {
    pub fn new(ctx: TransformContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &TransformContext {
        &self.ctx
    }

    /// Transform one value for `field`.
    ///
    /// Failures become `ImportError::Transform` naming the field.
    pub fn apply(&self, kind: TransformKind, field: &str, value: &Value) -> Result<Value> {
        self.convert(kind, value)
            .map_err(|message| ImportError::transform(field, message))
    }

    /// Transform one value, returning the bare failure reason.
    pub fn convert(&self, kind: TransformKind, value: &Value) -> std::result::Result<Value, String> {
        match kind {
            TransformKind::Direct => Ok(value.clone()),
            TransformKind::String => Ok(stringify(value)),
            TransformKind::Bool => to_bool(value),
            TransformKind::Int => to_int(value),
            TransformKind::Float => to_float(value),
            TransformKind::Date => to_date(value),
            TransformKind::Datetime => self.to_datetime(value),
        }
    }

    fn to_datetime(&self, value: &Value) -> std::result::Result<Value, String> {
        let offset = self.ctx.source_offset;
        let localize = |naive: NaiveDateTime| -> std::result::Result<Value, String> {
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| Value::Timestamp(dt.with_timezone(&Utc)))
                .ok_or_else(|| format!("ambiguous local time {}", naive))
        };

        match value {
            Value::Null => Ok(Value::Null),
            Value::Timestamp(ts) => Ok(Value::Timestamp(*ts)),
            Value::DateTimeOffset(dt) => Ok(Value::Timestamp(dt.with_timezone(&Utc))),
            Value::DateTime(naive) => localize(*naive),
            Value::Date(date) => localize(date.and_time(NaiveTime::MIN)),
            Value::Text(s) => {
                let s = normalize_spaces(s);
                if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
                    return Ok(Value::Timestamp(dt.with_timezone(&Utc)));
                }
                if let Some(naive) = parse_naive_datetime(&s) {
                    return localize(naive);
                }
                if let Some(date) = parse_date(&s) {
                    return localize(date.and_time(NaiveTime::MIN));
                }
                Err(format!("cannot parse '{}' as datetime", s))
            }
            other => Err(format!(
                "cannot convert {} value '{}' to datetime",
                other.type_name(),
                other
            )),
        }
    }
}

fn stringify(value: &Value) -> Value {
    match value {
        Value::Null => Value::Text(String::new()),
        Value::Text(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn to_bool(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Int(i) => Ok(Value::Bool(*i != 0)),
        Value::Float(f) => Ok(Value::Bool(*f != 0.0)),
        Value::Decimal(d) => Ok(Value::Bool(!d.is_zero())),
        Value::Text(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "y" => Ok(Value::Bool(true)),
            "0" | "false" | "n" => Ok(Value::Bool(false)),
            _ => Err(format!("unrecognized boolean value '{}'", s)),
        },
        other => Err(format!("cannot convert {} value to bool", other.type_name())),
    }
}

fn to_int(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => {
            if f.is_finite() && f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64
            {
                Ok(Value::Int(*f as i64))
            } else {
                Err(format!("non-integral value {}", f))
            }
        }
        Value::Decimal(d) => {
            if !d.fract().is_zero() {
                return Err(format!("non-integral value {}", d));
            }
            d.to_i64()
                .map(Value::Int)
                .ok_or_else(|| format!("value {} out of integer range", d))
        }
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("invalid integer '{}'", s)),
        other => Err(format!("cannot convert {} value to int", other.type_name())),
    }
}

fn to_float(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Decimal(d) => d
            .to_f64()
            .map(Value::Float)
            .ok_or_else(|| format!("value {} out of float range", d)),
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::Float)
            .ok_or_else(|| format!("invalid number '{}'", s)),
        other => Err(format!("cannot convert {} value to float", other.type_name())),
    }
}

fn to_date(value: &Value) -> std::result::Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Date(d) => Ok(Value::Date(*d)),
        Value::DateTime(dt) => Ok(Value::Date(dt.date())),
        Value::DateTimeOffset(dt) => Ok(Value::Date(dt.date_naive())),
        Value::Timestamp(ts) => Ok(Value::Date(ts.date_naive())),
        Value::Text(s) => {
            let s = normalize_spaces(s);
            if let Some(date) = parse_date(&s) {
                return Ok(Value::Date(date));
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
                return Ok(Value::Date(dt.date_naive()));
            }
            parse_naive_datetime(&s)
                .map(|dt| Value::Date(dt.date()))
                .ok_or_else(|| format!("cannot parse '{}' as date", s))
        }
        other => Err(format!(
            "cannot convert {} value '{}' to date",
            other.type_name(),
            other
        )),
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Collapse runs of whitespace; SQL Server pads single-digit days with a space.
fn normalize_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn engine() -> TransformEngine {
        TransformEngine::default()
    }

    fn ts(s: &str) -> Value {
        Value::Timestamp(DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc))
    }

    #[test]
    fn test_direct_passes_through() {
        let value = Value::Bytes(vec![1, 2, 3]);
        assert_eq!(
            engine().convert(TransformKind::Direct, &value).unwrap(),
            value
        );
        assert_eq!(
            engine().convert(TransformKind::Direct, &Value::Null).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_string_null_is_empty() {
        let e = engine();
        assert_eq!(
            e.convert(TransformKind::String, &Value::Null).unwrap(),
            Value::Text(String::new())
        );
        assert_eq!(
            e.convert(TransformKind::String, &Value::Int(42)).unwrap(),
            Value::Text("42".into())
        );
    }

    #[test]
    fn test_bool_accepted_encodings() {
        let e = engine();
        let cases = [
            (Value::Int(1), true),
            (Value::Int(0), false),
            (Value::from("true"), true),
            (Value::from("false"), false),
            (Value::from("Y"), true),
            (Value::from("N"), false),
            (Value::from(" TRUE "), true),
            (Value::from("1"), true),
            (Value::Int(-3), true),
            (Value::Float(0.0), false),
            (Value::Decimal(Decimal::new(5, 1)), true),
        ];
        for (input, expected) in cases {
            assert_eq!(
                e.convert(TransformKind::Bool, &input).unwrap(),
                Value::Bool(expected),
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn test_bool_rejects_unknown_strings() {
        let e = engine();
        for input in ["Maybe", "yes", "2", ""] {
            let err = e
                .apply(TransformKind::Bool, "active", &Value::from(input))
                .unwrap_err();
            assert!(matches!(err, ImportError::Transform { ref field, .. } if field == "active"));
        }
        assert_eq!(
            e.convert(TransformKind::Bool, &Value::Null).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_int_rejects_rather_than_truncates() {
        let e = engine();
        assert_eq!(
            e.convert(TransformKind::Int, &Value::from("42")).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            e.convert(TransformKind::Int, &Value::from(" -7 ")).unwrap(),
            Value::Int(-7)
        );
        assert!(e.convert(TransformKind::Int, &Value::from("4.9")).is_err());
        assert!(e.convert(TransformKind::Int, &Value::from("abc")).is_err());
        assert!(e.convert(TransformKind::Int, &Value::Float(4.9)).is_err());
        assert_eq!(
            e.convert(TransformKind::Int, &Value::Float(5.0)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            e.convert(TransformKind::Int, &Value::Decimal(Decimal::new(1200, 2)))
                .unwrap(),
            Value::Int(12)
        );
    }

    #[test]
    fn test_float_parsing() {
        let e = engine();
        assert_eq!(
            e.convert(TransformKind::Float, &Value::from("3.25")).unwrap(),
            Value::Float(3.25)
        );
        assert_eq!(
            e.convert(TransformKind::Float, &Value::Int(2)).unwrap(),
            Value::Float(2.0)
        );
        assert!(e.convert(TransformKind::Float, &Value::from("n/a")).is_err());
        assert!(e.convert(TransformKind::Float, &Value::from("NaN")).is_err());
    }

    #[test]
    fn test_date_drops_time_of_day() {
        let e = engine();
        let expected = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        let naive = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(23, 59, 0)
            .unwrap();
        assert_eq!(
            e.convert(TransformKind::Date, &Value::DateTime(naive)).unwrap(),
            expected
        );
        for input in ["2024-01-05", "2024-01-05 10:30:00", "Jan  5 2024 10:30AM"] {
            assert_eq!(
                e.convert(TransformKind::Date, &Value::from(input)).unwrap(),
                expected,
                "input {}",
                input
            );
        }
        assert!(e.convert(TransformKind::Date, &Value::from("05/01/24")).is_err());
    }

    #[test]
    fn test_datetime_uses_source_offset_for_naive_values() {
        let utc = engine();
        assert_eq!(
            utc.convert(TransformKind::Datetime, &Value::from("2024-01-05 10:30:00"))
                .unwrap(),
            ts("2024-01-05T10:30:00Z")
        );

        let paris = TransformEngine::new(TransformContext::with_offset_minutes(60).unwrap());
        assert_eq!(
            paris
                .convert(TransformKind::Datetime, &Value::from("2024-01-05 10:30:00"))
                .unwrap(),
            ts("2024-01-05T09:30:00Z")
        );
        // Explicit offsets win over the configured one.
        assert_eq!(
            paris
                .convert(
                    TransformKind::Datetime,
                    &Value::from("2024-01-05T10:30:00+00:00")
                )
                .unwrap(),
            ts("2024-01-05T10:30:00Z")
        );
    }

    #[test]
    fn test_datetime_native_format_and_null() {
        let e = engine();
        assert_eq!(
            e.convert(TransformKind::Datetime, &Value::from("Jan  5 2024  2:15PM"))
                .unwrap(),
            ts("2024-01-05T14:15:00Z")
        );
        assert_eq!(
            e.convert(TransformKind::Datetime, &Value::Null).unwrap(),
            Value::Null
        );
        assert!(e
            .convert(TransformKind::Datetime, &Value::from("yesterday"))
            .is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("str".parse::<TransformKind>().unwrap(), TransformKind::String);
        assert_eq!("DATETIME".parse::<TransformKind>().unwrap(), TransformKind::Datetime);
        assert!("json".parse::<TransformKind>().is_err());

        let kind: TransformKind = serde_yaml::from_str("str").unwrap();
        assert_eq!(kind, TransformKind::String);
    }
}
