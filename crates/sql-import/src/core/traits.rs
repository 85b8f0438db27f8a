//! Ports between the engine and the outside world.
//!
//! - [`SourceConnector`]: catalog queries and row streaming against one live source session
//! - [`SourceFactory`]: opens a [`SourceConnector`] from connection parameters
//! - [`TargetModel`]: field introspection and record writes in the host application

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

use super::schema::{ColumnInfo, FieldInfo, TableExtent};
use super::value::{EntityId, KeyValue, Record, Value};

/// Default connect and checkout timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Everything needed to open a session against a source server.
///
/// Holds the decrypted password only for as long as a connect takes.
#[derive(Clone)]
pub struct ConnectionParams {
    pub server: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    pub trust_server_certificate: bool,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .finish()
    }
}

/// Options for streaming rows from a source table.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Columns to read. The key column is read in addition if not listed.
    pub columns: Vec<String>,
    /// Ordering key column (keyset pagination).
    pub key_column: String,
    /// Resume after this key (exclusive).
    pub after_key: Option<KeyValue>,
    /// Never read past this key (inclusive).
    pub upto_key: Option<KeyValue>,
    /// Row filter, already screened.
    pub filter: Option<String>,
    /// Rows per page.
    pub batch_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            schema: "dbo".to_string(),
            table: String::new(),
            columns: Vec::new(),
            key_column: String::new(),
            after_key: None,
            upto_key: None,
            filter: None,
            batch_size: 100,
        }
    }
}

/// One source row with its ordering key.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub key: KeyValue,
    pub values: Vec<(String, Value)>,
}

impl SourceRow {
    /// Look up a column value by name (case-sensitive).
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }
}

/// A page of rows in key order.
pub type RowBatch = Vec<SourceRow>;

/// Read metadata and rows from one source session.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Server version banner (`SELECT @@VERSION`).
    async fn server_version(&self) -> Result<String>;

    /// All base tables as `(schema, table)`, ordered by schema then table.
    async fn list_tables(&self) -> Result<Vec<(String, String)>>;

    /// Columns of one table in ordinal order.
    ///
    /// Fails with `NotFound` when the table does not exist.
    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Primary key columns in key order (empty if none).
    async fn primary_key(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Columns that alone carry a unique index or constraint, the primary
    /// key included.
    async fn unique_columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Approximate row count from catalog statistics.
    async fn estimate_rows(&self, schema: &str, table: &str) -> Result<Option<i64>>;

    /// Exact count and maximum key of the rows matching `filter`.
    async fn extent(
        &self,
        schema: &str,
        table: &str,
        key_column: &str,
        filter: Option<&str>,
    ) -> Result<TableExtent>;

    /// Start streaming rows in key order.
    ///
    /// A background task fills the channel page by page. Dropping the
    /// receiver stops the task and releases its session.
    fn read_rows(&self, opts: ReadOptions) -> mpsc::Receiver<Result<RowBatch>>;

    /// Release pooled sessions.
    async fn close(&self) {}
}

/// Open source sessions.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn SourceConnector>>;
}

/// How a job writes each record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Always create a new record.
    #[default]
    #[serde(alias = "create")]
    CreateOnly,
    /// Update the record matching the key field, create it when absent.
    #[serde(alias = "create_update")]
    UpdateOrCreate,
    /// Update the record matching the key field, fail when absent.
    #[serde(alias = "update")]
    UpdateOnly,
}

impl TargetMode {
    /// Whether this mode looks up an existing record.
    pub fn needs_key(&self) -> bool {
        !matches!(self, TargetMode::CreateOnly)
    }

    /// Whether this mode may create a record, so required fields matter.
    pub fn may_create(&self) -> bool {
        !matches!(self, TargetMode::UpdateOnly)
    }
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetMode::CreateOnly => f.write_str("create_only"),
            TargetMode::UpdateOrCreate => f.write_str("update_or_create"),
            TargetMode::UpdateOnly => f.write_str("update_only"),
        }
    }
}

/// The host application's data model.
#[async_trait]
pub trait TargetModel: Send + Sync {
    /// Fields of an entity in declaration order.
    ///
    /// Fails with `NotFound` when the entity does not exist.
    async fn list_fields(&self, entity: &str) -> Result<Vec<FieldInfo>>;

    /// Create or update one record.
    ///
    /// `key` is `(field, value)` identifying the existing record for the
    /// update modes; it is ignored for `CreateOnly`. A returned id means the
    /// write is durable.
    async fn write(
        &self,
        entity: &str,
        mode: TargetMode,
        key: Option<(&str, &Value)>,
        values: &Record,
    ) -> Result<EntityId>;

    /// Backend name for logs (e.g., "postgres", "memory").
    fn kind(&self) -> &str;
}
