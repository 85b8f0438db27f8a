//! Source and target schema metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::KeyValue;

/// A table discovered on a source connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTable {
    /// Name of the owning connection.
    pub connection: String,

    /// Schema name.
    pub schema_name: String,

    /// Table name.
    pub table_name: String,

    /// Approximate row count, when it has been inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_estimate: Option<i64>,
}

impl LegacyTable {
    pub fn new(
        connection: impl Into<String>,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            connection: connection.into(),
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            row_estimate: None,
        }
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Whether this entry names the given schema and table.
    pub fn is(&self, schema: &str, table: &str) -> bool {
        self.schema_name == schema && self.table_name == table
    }
}

/// Column metadata from the source's information schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Declared data type (e.g., "int", "nvarchar", "datetime2").
    pub declared_type: String,

    /// Maximum length for character/binary types (-1 for max).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Ordinal position (1-based).
    pub ordinal: i32,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
            max_length: None,
            is_nullable: true,
            ordinal: 0,
        }
    }

    /// Whether values of this column can serve as an ordering key.
    pub fn is_keyable(&self) -> bool {
        matches!(
            self.declared_type.to_lowercase().as_str(),
            "int"
                | "bigint"
                | "smallint"
                | "tinyint"
                | "uniqueidentifier"
                | "char"
                | "nchar"
                | "varchar"
                | "nvarchar"
        )
    }
}

/// Writable field type reported by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    Char,
    Text,
    Date,
    DateTime,
    /// Anything the engine has no transform preference for.
    Other(String),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Boolean => f.write_str("boolean"),
            FieldType::Integer => f.write_str("integer"),
            FieldType::Float => f.write_str("float"),
            FieldType::Char => f.write_str("char"),
            FieldType::Text => f.write_str("text"),
            FieldType::Date => f.write_str("date"),
            FieldType::DateTime => f.write_str("datetime"),
            FieldType::Other(name) => f.write_str(name),
        }
    }
}

/// Field metadata for a target entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,

    /// Field type.
    pub field_type: FieldType,

    /// Whether a value must be supplied on create.
    pub required: bool,

    /// Whether the field is computed or otherwise not writable.
    #[serde(default)]
    pub readonly: bool,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
            readonly: false,
        }
    }

    /// Mark the field as not writable.
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn is_writable(&self) -> bool {
        !self.readonly
    }
}

/// Row count and upper ordering key of a (filtered) source table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExtent {
    /// Number of rows matching the filter.
    pub rows: u64,

    /// Highest ordering key among those rows.
    pub max_key: Option<KeyValue>,
}
