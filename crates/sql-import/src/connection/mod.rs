//! Source connections and their lifecycle.
//!
//! A [`Connection`] holds coordinates, sealed credentials, lifecycle state and
//! the cached table list. The [`ConnectionManager`] is the only thing that
//! mutates those fields: `test_connection` captures every failure into them,
//! and `fetch_tables` refuses to run unless the last test succeeded.

mod secret;

pub use secret::SecretCipher;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, ConnectionConfig};
use crate::core::{ConnectionParams, LegacyTable, SourceConnector, SourceFactory};
use crate::error::{ImportError, Result};
use crate::mapping::Mapping;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Draft,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Draft => f.write_str("draft"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Error => f.write_str("error"),
        }
    }
}

/// A configured source server.
#[derive(Clone, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub database: String,
    pub username: String,

    /// Password sealed by the manager's [`SecretCipher`].
    sealed_password: String,

    pub timeout_secs: u64,
    pub trust_server_certificate: bool,
    pub state: ConnectionState,

    /// Last successful test.
    pub last_connection_date: Option<DateTime<Utc>>,

    /// Last failure, cleared on success.
    pub error_message: Option<String>,

    /// Tables discovered by the last fetch.
    pub tables: Vec<LegacyTable>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("state", &self.state)
            .field("last_connection_date", &self.last_connection_date)
            .field("error_message", &self.error_message)
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl Connection {
    /// Build a draft connection from configuration, sealing the password.
    pub fn from_config(config: &ConnectionConfig, cipher: &SecretCipher) -> Result<Self> {
        let password = config.resolve_password()?;
        Ok(Self {
            name: config.name.clone(),
            server: config.server.clone(),
            port: config.port,
            database: config.database.clone(),
            username: config.username.clone(),
            sealed_password: cipher.seal(&password)?,
            timeout_secs: config.timeout_secs,
            trust_server_certificate: config.trust_server_certificate,
            state: ConnectionState::Draft,
            last_connection_date: None,
            error_message: None,
            tables: Vec::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Replace the password. The connection must be tested again.
    pub fn set_password(&mut self, password: &str, cipher: &SecretCipher) -> Result<()> {
        self.sealed_password = cipher.seal(password)?;
        self.state = ConnectionState::Draft;
        Ok(())
    }

    /// Session parameters with the password opened.
    pub fn params(&self, cipher: &SecretCipher) -> Result<ConnectionParams> {
        let password = cipher.open(&self.sealed_password)?;
        if password.is_empty() {
            return Err(ImportError::Config(format!(
                "Password is required for connection '{}'",
                self.name
            )));
        }
        Ok(ConnectionParams {
            server: self.server.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            password,
            timeout_secs: self.timeout_secs,
            trust_server_certificate: self.trust_server_certificate,
        })
    }

    /// Cached tables rendered for display, grouped by schema.
    pub fn available_tables_text(&self) -> String {
        if self.tables.is_empty() {
            return "No tables found".to_string();
        }

        let mut by_schema: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for table in &self.tables {
            by_schema
                .entry(table.schema_name.as_str())
                .or_default()
                .push(table.table_name.as_str());
        }

        let mut out = format!("Found {} tables:\n\n", self.tables.len());
        for (schema, mut tables) in by_schema {
            tables.sort_unstable();
            out.push_str(&format!("Schema: {}\n", schema));
            for table in tables {
                out.push_str(&format!("  • {}\n", table));
            }
            out.push('\n');
        }
        out
    }

    fn upsert_tables(&mut self, fetched: &[(String, String)]) {
        let mut previous = std::mem::take(&mut self.tables);
        self.tables = fetched
            .iter()
            .map(|(schema, table)| {
                match previous.iter().position(|t| t.is(schema, table)) {
                    Some(idx) => previous.swap_remove(idx),
                    None => LegacyTable::new(&self.name, schema, table),
                }
            })
            .collect();
    }
}

/// Outcome of a connection test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub connected: bool,
    pub server_version: Option<String>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Owns every connection and the live sessions opened for them.
pub struct ConnectionManager {
    connections: RwLock<BTreeMap<String, Connection>>,
    sessions: Mutex<HashMap<String, Arc<dyn SourceConnector>>>,
    factory: Arc<dyn SourceFactory>,
    cipher: SecretCipher,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn SourceFactory>, cipher: SecretCipher) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            factory,
            cipher,
        }
    }

    /// Build a manager holding every connection in `config`.
    pub fn from_config(config: &Config, factory: Arc<dyn SourceFactory>) -> Result<Self> {
        let manager = Self::new(factory, SecretCipher::from_env(&config.settings.secret_env));
        for conn in &config.connections {
            manager.add(conn)?;
        }
        Ok(manager)
    }

    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    /// Register a connection from configuration.
    pub fn add(&self, config: &ConnectionConfig) -> Result<()> {
        let conn = Connection::from_config(config, &self.cipher)?;
        self.insert(conn)
    }

    /// Register a connection. Names are unique.
    pub fn insert(&self, conn: Connection) -> Result<()> {
        let mut connections = self.write_lock()?;
        if connections.contains_key(&conn.name) {
            return Err(ImportError::Precondition(format!(
                "Connection '{}' already exists",
                conn.name
            )));
        }
        connections.insert(conn.name.clone(), conn);
        Ok(())
    }

    /// Snapshot of one connection.
    pub fn get(&self, name: &str) -> Result<Connection> {
        self.read_lock()?
            .get(name)
            .cloned()
            .ok_or_else(|| ImportError::NotFound(format!("connection '{}'", name)))
    }

    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.read_lock()?.keys().cloned().collect())
    }

    /// Rotate a password. The connection returns to draft and its session is dropped.
    pub fn set_password(&self, name: &str, password: &str) -> Result<()> {
        {
            let mut connections = self.write_lock()?;
            let conn = connections
                .get_mut(name)
                .ok_or_else(|| ImportError::NotFound(format!("connection '{}'", name)))?;
            conn.set_password(password, &self.cipher)?;
        }
        self.drop_session(name);
        info!("Password changed for connection {}, state reset to draft", name);
        Ok(())
    }

    /// Remove a connection that no mapping references.
    pub fn remove(&self, name: &str, mappings: &[Mapping]) -> Result<Connection> {
        let users: Vec<&str> = mappings
            .iter()
            .filter(|m| m.connections.iter().any(|c| c == name))
            .map(|m| m.name.as_str())
            .collect();
        if !users.is_empty() {
            return Err(ImportError::Precondition(format!(
                "Connection '{}' is used by mappings: {}",
                name,
                users.join(", ")
            )));
        }

        let removed = self
            .write_lock()?
            .remove(name)
            .ok_or_else(|| ImportError::NotFound(format!("connection '{}'", name)))?;
        self.drop_session(name);
        Ok(removed)
    }

    /// Open a session, run the version query, and record the outcome.
    ///
    /// Never fails: every problem ends up in the returned check and in the
    /// connection's `state` and `error_message`.
    pub async fn test_connection(&self, name: &str) -> ConnectionCheck {
        let started = Instant::now();
        let outcome = self.open_checked(name).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((session, version)) => {
                self.store_session(name, session);
                let recorded = self.update(name, |conn| {
                    conn.state = ConnectionState::Connected;
                    conn.last_connection_date = Some(Utc::now());
                    conn.error_message = None;
                });
                info!(
                    "Connection {} succeeded in {}ms: {}",
                    name,
                    latency_ms,
                    version.lines().next().unwrap_or_default()
                );
                ConnectionCheck {
                    connected: recorded.is_ok(),
                    server_version: Some(version),
                    latency_ms,
                    error: recorded.err().map(|e| e.summary()),
                }
            }
            Err(e) => {
                let message = e.summary();
                self.drop_session(name);
                // Unknown names have no fields to record into.
                let _ = self.update(name, |conn| {
                    conn.state = ConnectionState::Error;
                    conn.error_message = Some(message.clone());
                });
                warn!("Connection {} failed: {}", name, message);
                ConnectionCheck {
                    connected: false,
                    server_version: None,
                    latency_ms,
                    error: Some(message),
                }
            }
        }
    }

    async fn open_checked(&self, name: &str) -> Result<(Arc<dyn SourceConnector>, String)> {
        let params = self.get(name)?.params(&self.cipher)?;
        let timeout = Duration::from_secs(params.timeout_secs);
        debug!("Connecting to {}:{}/{}", params.server, params.port, params.database);

        let session = tokio::time::timeout(timeout, self.factory.connect(&params))
            .await
            .map_err(|_| {
                ImportError::Connectivity(format!(
                    "Timed out after {}s connecting to {}:{}",
                    params.timeout_secs, params.server, params.port
                ))
            })??;
        let version = tokio::time::timeout(timeout, session.server_version())
            .await
            .map_err(|_| {
                ImportError::Connectivity(format!(
                    "Timed out after {}s waiting for server version",
                    params.timeout_secs
                ))
            })??;
        Ok((session, version))
    }

    /// Test the connection unless it is already connected.
    ///
    /// Fails with `Connectivity` carrying the test's error message.
    pub async fn ensure_connected(&self, name: &str) -> Result<()> {
        if self.get(name)?.is_connected() {
            return Ok(());
        }
        let check = self.test_connection(name).await;
        if check.connected {
            Ok(())
        } else {
            Err(ImportError::Connectivity(check.error.unwrap_or_else(|| {
                format!("Connection '{}' could not be established", name)
            })))
        }
    }

    /// List tables and refresh the connection's cached table list.
    ///
    /// Fails with `Precondition`, mutating nothing, unless the connection
    /// is connected. Network failures after that are `Connectivity`.
    pub async fn fetch_tables(&self, name: &str) -> Result<Vec<(String, String)>> {
        let conn = self.get(name)?;
        if !conn.is_connected() {
            return Err(ImportError::Precondition(format!(
                "Connection '{}' is not connected (state: {})",
                name, conn.state
            )));
        }
        let session = self.session(name).await?;

        let tables = match session.list_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                self.record_failure(name, &e);
                return Err(e);
            }
        };

        self.update(name, |conn| conn.upsert_tables(&tables))?;
        info!("Found {} tables on connection {}", tables.len(), name);
        Ok(tables)
    }

    /// Re-fetch the table list and return how many tables were found.
    pub async fn refresh_tables(&self, name: &str) -> Result<usize> {
        Ok(self.fetch_tables(name).await?.len())
    }

    /// Live session for a connected connection.
    ///
    /// Fails with `Connectivity` when the connection is not connected.
    pub async fn session(&self, name: &str) -> Result<Arc<dyn SourceConnector>> {
        let conn = self.get(name)?;
        if !conn.is_connected() {
            return Err(ImportError::Connectivity(format!(
                "Connection '{}' is not connected (state: {})",
                name, conn.state
            )));
        }

        if let Some(session) = self.cached_session(name) {
            return Ok(session);
        }

        let params = conn.params(&self.cipher)?;
        let timeout = Duration::from_secs(params.timeout_secs);
        let opened = match tokio::time::timeout(timeout, self.factory.connect(&params)).await {
            Ok(result) => result,
            Err(_) => Err(ImportError::Connectivity(format!(
                "Timed out after {}s connecting to {}:{}",
                params.timeout_secs, params.server, params.port
            ))),
        };
        match opened {
            Ok(session) => {
                self.store_session(name, session.clone());
                Ok(session)
            }
            Err(e) => {
                self.record_failure(name, &e);
                Err(e)
            }
        }
    }

    /// Pick the first usable connection of a mapping, testing in order.
    pub async fn resolve_for(
        &self,
        mapping: &str,
        connections: &[String],
    ) -> Result<(String, Arc<dyn SourceConnector>)> {
        let mut failures = Vec::new();
        for name in connections {
            let connected = match self.get(name) {
                Ok(conn) => conn.is_connected(),
                Err(e) => {
                    failures.push(format!("{}: {}", name, e.summary()));
                    continue;
                }
            };
            if !connected {
                let check = self.test_connection(name).await;
                if !check.connected {
                    failures.push(format!(
                        "{}: {}",
                        name,
                        check.error.unwrap_or_else(|| "not connected".to_string())
                    ));
                    continue;
                }
            }
            match self.session(name).await {
                Ok(session) => {
                    debug!("Mapping {} served by connection {}", mapping, name);
                    return Ok((name.clone(), session));
                }
                Err(e) => failures.push(format!("{}: {}", name, e.summary())),
            }
        }

        Err(ImportError::Connectivity(format!(
            "No usable connection for mapping '{}' ({})",
            mapping,
            if failures.is_empty() {
                "none configured".to_string()
            } else {
                failures.join("; ")
            }
        )))
    }

    /// Close every live session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = match self.sessions.lock() {
            Ok(mut guard) => guard.drain().map(|(_, s)| s).collect(),
            Err(_) => return,
        };
        for session in sessions {
            session.close().await;
        }
    }

    /// Store a row estimate on a cached table entry.
    pub(crate) fn set_row_estimate(&self, name: &str, schema: &str, table: &str, rows: Option<i64>) {
        let _ = self.update(name, |conn| {
            if let Some(entry) = conn.tables.iter_mut().find(|t| t.is(schema, table)) {
                entry.row_estimate = rows;
            }
        });
    }

    /// Record a connectivity failure on the connection.
    pub(crate) fn record_failure(&self, name: &str, err: &ImportError) {
        if !err.is_connectivity() {
            return;
        }
        self.drop_session(name);
        let message = err.summary();
        let _ = self.update(name, |conn| {
            conn.state = ConnectionState::Error;
            conn.error_message = Some(message);
        });
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Connection)) -> Result<()> {
        let mut connections = self.write_lock()?;
        let conn = connections
            .get_mut(name)
            .ok_or_else(|| ImportError::NotFound(format!("connection '{}'", name)))?;
        f(conn);
        Ok(())
    }

    fn cached_session(&self, name: &str) -> Option<Arc<dyn SourceConnector>> {
        self.sessions.lock().ok()?.get(name).cloned()
    }

    fn store_session(&self, name: &str, session: Arc<dyn SourceConnector>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(name.to_string(), session);
        }
    }

    fn drop_session(&self, name: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(name);
        }
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Connection>>> {
        self.connections
            .read()
            .map_err(|_| ImportError::State("connection registry lock poisoned".into()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Connection>>> {
        self.connections
            .write()
            .map_err(|_| ImportError::State("connection registry lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ColumnInfo;
    use crate::source::MemorySource;

    fn conn_config(name: &str) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            server: "db1".to_string(),
            port: 1433,
            database: "legacy".to_string(),
            username: "sa".to_string(),
            password: Some("secret".to_string()),
            password_env: None,
            timeout_secs: 5,
            trust_server_certificate: true,
        }
    }

    fn source() -> MemorySource {
        let source = MemorySource::new("Microsoft SQL Server 2019 (RTM) - 15.0.2000.5");
        source.add_table(
            "dbo",
            "Customers",
            vec![ColumnInfo::new("Id", "int"), ColumnInfo::new("CustomerName", "nvarchar")],
            Some("Id"),
        );
        source.add_table("sales", "Orders", vec![ColumnInfo::new("Id", "int")], Some("Id"));
        source
    }

    fn manager(source: &MemorySource) -> ConnectionManager {
        let manager = ConnectionManager::new(Arc::new(source.clone()), SecretCipher::ephemeral());
        manager.add(&conn_config("legacy")).unwrap();
        manager
    }

    #[tokio::test]
    async fn test_test_connection_success_records_state() {
        let source = source();
        let manager = manager(&source);

        let check = manager.test_connection("legacy").await;
        assert!(check.connected);
        assert!(check.server_version.unwrap().contains("SQL Server"));

        let conn = manager.get("legacy").unwrap();
        assert_eq!(conn.state, ConnectionState::Connected);
        assert!(conn.last_connection_date.is_some());
        assert!(conn.error_message.is_none());
    }

    #[tokio::test]
    async fn test_test_connection_failure_keeps_last_success() {
        let source = source();
        let manager = manager(&source);
        assert!(manager.test_connection("legacy").await.connected);
        let first = manager.get("legacy").unwrap().last_connection_date;

        source.set_unreachable(true);
        let check = manager.test_connection("legacy").await;
        assert!(!check.connected);
        assert!(check.error.is_some());

        let conn = manager.get("legacy").unwrap();
        assert_eq!(conn.state, ConnectionState::Error);
        assert!(conn.error_message.is_some());
        assert_eq!(conn.last_connection_date, first);
    }

    #[tokio::test]
    async fn test_test_connection_unknown_name_does_not_fail() {
        let source = source();
        let manager = manager(&source);
        let check = manager.test_connection("nope").await;
        assert!(!check.connected);
    }

    #[tokio::test]
    async fn test_fetch_tables_requires_connected() {
        let source = source();
        let manager = manager(&source);

        let err = manager.fetch_tables("legacy").await.unwrap_err();
        assert!(matches!(err, ImportError::Precondition(_)));
        let conn = manager.get("legacy").unwrap();
        assert_eq!(conn.state, ConnectionState::Draft);
        assert!(conn.tables.is_empty());
        assert!(conn.error_message.is_none());

        source.set_unreachable(true);
        manager.test_connection("legacy").await;
        let err = manager.fetch_tables("legacy").await.unwrap_err();
        assert!(matches!(err, ImportError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_fetch_tables_network_failure_is_connectivity() {
        let source = source();
        let manager = manager(&source);
        manager.test_connection("legacy").await;
        manager.close_all().await;
        source.set_unreachable(true);

        let err = manager.fetch_tables("legacy").await.unwrap_err();
        assert!(matches!(err, ImportError::Connectivity(_)));
        assert_eq!(manager.get("legacy").unwrap().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_ensure_connected_from_fresh_manager() {
        let source = source();
        let manager = manager(&source);

        manager.ensure_connected("legacy").await.unwrap();
        assert_eq!(manager.get("legacy").unwrap().state, ConnectionState::Connected);
        assert_eq!(manager.fetch_tables("legacy").await.unwrap().len(), 2);

        let source = self::source();
        source.set_unreachable(true);
        let manager = self::manager(&source);
        let err = manager.ensure_connected("legacy").await.unwrap_err();
        assert!(matches!(err, ImportError::Connectivity(_)));
        assert!(err.to_string().contains("unreachable"));
        assert!(matches!(
            manager.ensure_connected("missing").await,
            Err(ImportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_tables_is_idempotent() {
        let source = source();
        let manager = manager(&source);
        manager.test_connection("legacy").await;

        let tables = manager.fetch_tables("legacy").await.unwrap();
        assert_eq!(
            tables,
            vec![
                ("dbo".to_string(), "Customers".to_string()),
                ("sales".to_string(), "Orders".to_string())
            ]
        );
        assert_eq!(manager.refresh_tables("legacy").await.unwrap(), 2);
        assert_eq!(manager.get("legacy").unwrap().tables.len(), 2);
    }

    #[tokio::test]
    async fn test_available_tables_text_groups_by_schema() {
        let source = source();
        let manager = manager(&source);
        manager.test_connection("legacy").await;
        manager.fetch_tables("legacy").await.unwrap();

        let text = manager.get("legacy").unwrap().available_tables_text();
        assert!(text.starts_with("Found 2 tables:"));
        assert!(text.contains("Schema: dbo\n  • Customers\n"));
        assert!(text.contains("Schema: sales\n  • Orders\n"));
    }

    #[tokio::test]
    async fn test_set_password_resets_to_draft() {
        let source = source();
        let manager = manager(&source);
        manager.test_connection("legacy").await;

        manager.set_password("legacy", "rotated").unwrap();
        let conn = manager.get("legacy").unwrap();
        assert_eq!(conn.state, ConnectionState::Draft);
        assert_eq!(conn.params(manager.cipher()).unwrap().password, "rotated");
    }

    #[tokio::test]
    async fn test_remove_blocked_while_referenced() {
        let source = source();
        let manager = manager(&source);
        let mapping = Mapping::new("customers", "legacy", "Customers", "res.partner");

        let err = manager.remove("legacy", &[mapping]).unwrap_err();
        assert!(matches!(err, ImportError::Precondition(_)));
        assert!(manager.remove("legacy", &[]).is_ok());
        assert!(manager.get("legacy").is_err());
    }

    #[tokio::test]
    async fn test_resolve_for_fails_over() {
        let source = source();
        let manager = manager(&source);
        let mut broken = conn_config("broken");
        broken.password = Some(String::new());
        manager.add(&broken).unwrap();

        let mut mapping = Mapping::new("customers", "broken", "Customers", "res.partner");
        mapping.connections.push("legacy".to_string());

        let (name, _) = manager
            .resolve_for(&mapping.name, &mapping.connections)
            .await
            .unwrap();
        assert_eq!(name, "legacy");
        assert_eq!(manager.get("broken").unwrap().state, ConnectionState::Error);
    }

    #[test]
    fn test_connection_debug_redacts_password() {
        let conn = Connection::from_config(&conn_config("legacy"), &SecretCipher::ephemeral()).unwrap();
        let debug = format!("{:?}", conn);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret"));
    }
}
