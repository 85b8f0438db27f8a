//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{FieldInfo, DEFAULT_TIMEOUT_SECS};
use crate::error::{ImportError, Result};
use crate::mapping::Mapping;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine-wide settings.
    #[serde(default)]
    pub settings: Settings,

    /// Host application data store.
    pub target: TargetConfig,

    /// Source connections.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    /// Import mappings.
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl Config {
    /// Find a connection by name.
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ImportError::Config(format!("Unknown connection '{}'", name)))
    }

    /// Find a mapping by name.
    pub fn mapping(&self, name: &str) -> Result<&Mapping> {
        self.mappings
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ImportError::Config(format!("Unknown mapping '{}'", name)))
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding job state files (default: ".sql-import/jobs").
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// UTC offset of the source server's local time, in minutes (default: 0).
    #[serde(default)]
    pub source_utc_offset_minutes: i32,

    /// Rows read by the mapping test (default: 10).
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Environment variable holding the credential passphrase
    /// (default: "SQL_IMPORT_SECRET").
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            source_utc_offset_minutes: 0,
            sample_size: default_sample_size(),
            secret_env: default_secret_env(),
        }
    }
}

/// Target data store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetConfig {
    /// PostgreSQL database of the host application.
    Postgres(PostgresTargetConfig),

    /// In-process store for dry runs.
    Memory(MemoryTargetConfig),
}

impl TargetConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TargetConfig::Postgres(_) => "postgres",
            TargetConfig::Memory(_) => "memory",
        }
    }
}

/// PostgreSQL target configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresTargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema for unqualified entity names (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Column returned as the record id (default: "id").
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_pg_pool_size")]
    pub max_connections: usize,
}

impl fmt::Debug for PostgresTargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("id_column", &self.id_column)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// In-memory target configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryTargetConfig {
    /// Entity name to field list.
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<FieldInfo>>,
}

/// One source connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unique connection name.
    pub name: String,

    /// Server host name or address.
    pub server: String,

    /// Server port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub username: String,

    /// Inline password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Connect and checkout timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Trust the server certificate without validation (default: false).
    #[serde(default)]
    pub trust_server_certificate: bool,
}

impl ConnectionConfig {
    /// Resolve the plaintext password from the inline value or the environment.
    pub fn resolve_password(&self) -> Result<String> {
        if let Some(var) = &self.password_env {
            return std::env::var(var).map_err(|_| {
                ImportError::Config(format!(
                    "connections[{}].password_env: environment variable {} is not set",
                    self.name, var
                ))
            });
        }
        Ok(self.password.clone().unwrap_or_default())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("password_env", &self.password_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .finish()
    }
}

fn default_state_dir() -> String {
    ".sql-import/jobs".to_string()
}

fn default_sample_size() -> usize {
    10
}

fn default_secret_env() -> String {
    "SQL_IMPORT_SECRET".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_pg_pool_size() -> usize {
    4
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
