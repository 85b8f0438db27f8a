//! # sql-import
//!
//! Import engine that moves rows from SQL Server tables into a host
//! application's entities through configured field mappings.
//!
//! - **Connections** with encrypted credentials, reachability tests and
//!   table discovery
//! - **Schema inspection** of source tables (columns, primary key, row estimate)
//! - **Mappings** of source columns to target fields with a small transform
//!   language, validation and auto-generation
//! - **Import jobs** that stream the source in keyset batches, isolate row
//!   failures and resume after cancellation or errors
//!
//! ## Example
//!
//! ```rust,no_run
//! use sql_import::{Config, ImportEngine};
//!
//! #[tokio::main]
//! async fn main() -> sql_import::Result<()> {
//!     let config = Config::load("sql-import.yaml")?;
//!     let engine = ImportEngine::new(config).await?;
//!     let id = engine.start_mapping("customers").await?;
//!     let job = engine.executor().wait(&id).await?;
//!     println!("Imported {} of {} rows", job.imported_records, job.total_records);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod job;
pub mod mapping;
pub mod source;
pub mod target;
pub mod transform;

// Re-exports for convenient access
pub use config::{Config, ConnectionConfig, TargetConfig};
pub use connection::{Connection, ConnectionCheck, ConnectionManager, ConnectionState};
pub use crate::core::{ColumnInfo, FieldInfo, KeyValue, LegacyTable, Record, TargetMode, Value};
pub use engine::ImportEngine;
pub use error::{ImportError, Result};
pub use inspect::{SchemaInspector, TableProfile};
pub use job::{ImportJobExecutor, Job, JobState};
pub use mapping::{FieldRule, Mapping, MappingResolver, ValidationIssue};
pub use transform::{TransformEngine, TransformKind};
