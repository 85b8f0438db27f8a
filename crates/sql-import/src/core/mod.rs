//! Core types shared by every part of the engine.
//!
//! - [`value`]: source values, ordering keys and target records
//! - [`schema`]: table, column and field metadata
//! - [`identifier`]: identifier quoting and row-filter screening
//! - [`traits`]: the source and target ports

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{ColumnInfo, FieldInfo, FieldType, LegacyTable, TableExtent};
pub use traits::{
    ConnectionParams, ReadOptions, RowBatch, SourceConnector, SourceFactory, SourceRow,
    TargetMode, TargetModel, DEFAULT_TIMEOUT_SECS,
};
pub use value::{EntityId, KeyValue, Record, Value};
