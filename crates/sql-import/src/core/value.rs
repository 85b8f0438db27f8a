//! Value types flowing from source rows to target records.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single column value read from the source or produced by a transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// SQL NULL.
    Null,

    /// Boolean (`bit`).
    Bool(bool),

    /// Any integer width, widened to 64 bits.
    Int(i64),

    /// Floating point (`real`, `float`).
    Float(f64),

    /// Exact numeric (`decimal`, `numeric`, `money`).
    Decimal(Decimal),

    /// Character data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// `uniqueidentifier`.
    Uuid(Uuid),

    /// Calendar date.
    Date(NaiveDate),

    /// Time of day.
    Time(NaiveTime),

    /// Timestamp without zone, as stored by the source.
    DateTime(NaiveDateTime),

    /// Timestamp with zone offset (`datetimeoffset`).
    DateTimeOffset(DateTime<FixedOffset>),

    /// Absolute timestamp, produced by the datetime transform.
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type label used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
            Value::DateTimeOffset(_) => "datetimeoffset",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Render as text for drivers that bind every parameter as text.
    ///
    /// Returns `None` for NULL. Binary data uses the `\x` hex escape format.
    pub fn render_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bytes(b) => Some(format!("\\x{}", hex::encode(b))),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "{}", hex::encode(v)),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Time(v) => write!(f, "{}", v.format("%H:%M:%S%.f")),
            Value::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::DateTimeOffset(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Ordering-key value used for keyset pagination and resume.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyValue {
    /// Integer key (int, bigint, smallint, tinyint).
    Int(i64),
    /// GUID key.
    Uuid(Uuid),
    /// Character key.
    Text(String),
}

impl KeyValue {
    /// Extract an ordering key from a column value. NULL and non-key types yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(KeyValue::Int(*v)),
            Value::Uuid(v) => Some(KeyValue::Uuid(*v)),
            Value::Text(v) => Some(KeyValue::Text(v.clone())),
            _ => None,
        }
    }

    /// Convert back into a column value.
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Int(v) => Value::Int(*v),
            KeyValue::Uuid(v) => Value::Uuid(*v),
            KeyValue::Text(v) => Value::Text(v.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Uuid(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "'{}'", v),
        }
    }
}

/// Field values for one target record, in rule order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any previous value for the same name.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (field, value) in iter {
            record.insert(field, value);
        }
        record
    }
}

/// Identifier of a record created or updated in the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text_for_binding() {
        assert_eq!(Value::Null.render_text(), None);
        assert_eq!(Value::Bool(true).render_text().as_deref(), Some("true"));
        assert_eq!(
            Value::Bytes(vec![0xde, 0xad]).render_text().as_deref(),
            Some("\\xdead")
        );
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(Value::Date(date).render_text().as_deref(), Some("2024-01-05"));
    }

    #[test]
    fn test_key_value_from_value() {
        assert_eq!(KeyValue::from_value(&Value::Int(7)), Some(KeyValue::Int(7)));
        assert_eq!(
            KeyValue::from_value(&Value::Text("A-1".into())),
            Some(KeyValue::Text("A-1".into()))
        );
        assert_eq!(KeyValue::from_value(&Value::Null), None);
        assert_eq!(KeyValue::from_value(&Value::Float(1.5)), None);
    }

    #[test]
    fn test_record_insert_replaces_same_field() {
        let mut record = Record::new();
        record.insert("name", Value::from("a"));
        record.insert("active", Value::Bool(true));
        record.insert("name", Value::from("b"));

        assert_eq!(record.len(), 2);
        assert_eq!(record.get("name"), Some(&Value::Text("b".into())));
        let names: Vec<_> = record.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["name", "active"]);
    }

    #[test]
    fn test_key_value_serde_round_trip() {
        let key = KeyValue::Text("CUST-9".into());
        let json = serde_json::to_string(&key).unwrap();
        let back: KeyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
