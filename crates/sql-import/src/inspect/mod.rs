//! Source schema inspection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::core::{ColumnInfo, LegacyTable, SourceConnector};
use crate::error::{ImportError, Result};

/// Columns, key and size of one source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProfile {
    pub table: LegacyTable,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub row_estimate: Option<i64>,
}

impl TableProfile {
    /// Columns rendered one per line for display.
    pub fn columns_text(&self) -> String {
        let mut out = format!(
            "Found {} columns in table {}:\n",
            self.columns.len(),
            self.table.full_name()
        );
        for col in &self.columns {
            let key = if self.primary_key.contains(&col.name) {
                " [PK]"
            } else {
                ""
            };
            let length = match col.max_length {
                Some(-1) => "(max)".to_string(),
                Some(n) if n > 0 => format!("({})", n),
                _ => String::new(),
            };
            let null = if col.is_nullable { "" } else { " NOT NULL" };
            out.push_str(&format!(
                "  {} {}{}{}{}\n",
                col.name, col.declared_type, length, null, key
            ));
        }
        out
    }
}

/// Reads table metadata through a connection's live session.
#[derive(Clone)]
pub struct SchemaInspector {
    connections: Arc<ConnectionManager>,
}

impl SchemaInspector {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Columns of a table in ordinal order.
    ///
    /// Fails with `Connectivity` when the connection is not connected and
    /// with `NotFound` when the table no longer exists.
    pub async fn fetch_columns(&self, connection: &str, table: &LegacyTable) -> Result<Vec<ColumnInfo>> {
        let session = self.connections.session(connection).await?;
        self.track(
            connection,
            session.list_columns(&table.schema_name, &table.table_name).await,
        )
    }

    /// Columns, primary key and row estimate; the estimate is cached on the table entry.
    pub async fn inspect_table(&self, connection: &str, table: &LegacyTable) -> Result<TableProfile> {
        let session = self.connections.session(connection).await?;
        let schema = &table.schema_name;
        let name = &table.table_name;

        let columns = self.track(connection, session.list_columns(schema, name).await)?;
        let primary_key = self.track(connection, session.primary_key(schema, name).await)?;
        let row_estimate = self.track(connection, session.estimate_rows(schema, name).await)?;
        self.connections
            .set_row_estimate(connection, schema, name, row_estimate);

        debug!(
            "Inspected {}: {} columns, key {:?}, ~{} rows",
            table.full_name(),
            columns.len(),
            primary_key,
            row_estimate.unwrap_or(0)
        );

        let mut table = table.clone();
        table.row_estimate = row_estimate;
        Ok(TableProfile {
            table,
            columns,
            primary_key,
            row_estimate,
        })
    }

    fn track<T>(&self, connection: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.connections.record_failure(connection, e);
        }
        result
    }
}

/// Pick the column that orders a table for keyset reads.
///
/// An explicit key must exist, be orderable and identify rows: it is the
/// single-column primary key or a NOT NULL column with a unique index.
/// Without one the table's single-column primary key is used.
pub async fn resolve_order_key(
    source: &dyn SourceConnector,
    schema: &str,
    table: &str,
    explicit: Option<&str>,
) -> Result<String> {
    let columns = source.list_columns(schema, table).await?;

    if let Some(key) = explicit {
        let col = columns.iter().find(|c| c.name == key).ok_or_else(|| {
            ImportError::NotFound(format!("column {}.{}.{}", schema, table, key))
        })?;
        if !col.is_keyable() {
            return Err(ImportError::Precondition(format!(
                "order_key {} has type {} which cannot order a keyset read",
                key, col.declared_type
            )));
        }
        let pk = source.primary_key(schema, table).await?;
        if pk.len() == 1 && pk[0] == key {
            return Ok(key.to_string());
        }
        let unique = source.unique_columns(schema, table).await?;
        if !unique.iter().any(|c| c == key) {
            return Err(ImportError::Precondition(format!(
                "order_key {} of {}.{} is neither the primary key nor backed by a unique index",
                key, schema, table
            )));
        }
        if col.is_nullable {
            return Err(ImportError::Precondition(format!(
                "order_key {} of {}.{} allows NULL",
                key, schema, table
            )));
        }
        return Ok(key.to_string());
    }

    let pk = source.primary_key(schema, table).await?;
    match pk.as_slice() {
        [single] => {
            let keyable = columns
                .iter()
                .find(|c| &c.name == single)
                .is_some_and(ColumnInfo::is_keyable);
            if keyable {
                Ok(single.clone())
            } else {
                Err(ImportError::Precondition(format!(
                    "primary key {} of {}.{} cannot order a keyset read; set order_key",
                    single, schema, table
                )))
            }
        }
        [] => Err(ImportError::Precondition(format!(
            "{}.{} has no primary key; set order_key",
            schema, table
        ))),
        _ => Err(ImportError::Precondition(format!(
            "{}.{} has a composite primary key; set order_key",
            schema, table
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::SecretCipher;
    use crate::core::Value;
    use crate::source::MemorySource;

    fn setup() -> (MemorySource, Arc<ConnectionManager>) {
        let source = MemorySource::new("memory");
        source.add_table(
            "dbo",
            "Customers",
            vec![
                ColumnInfo::new("Id", "int"),
                ColumnInfo::new("CustomerName", "nvarchar"),
                ColumnInfo::new("Balance", "money"),
            ],
            Some("Id"),
        );
        source.add_table("dbo", "Log", vec![ColumnInfo::new("Message", "nvarchar")], None);
        source.insert_row("dbo", "Customers", vec![("Id", Value::Int(1))]);

        let manager = ConnectionManager::new(Arc::new(source.clone()), SecretCipher::ephemeral());
        manager
            .add(&ConnectionConfig {
                name: "legacy".into(),
                server: "db1".into(),
                port: 1433,
                database: "legacy".into(),
                username: "sa".into(),
                password: Some("pw".into()),
                password_env: None,
                timeout_secs: 5,
                trust_server_certificate: false,
            })
            .unwrap();
        (source, Arc::new(manager))
    }

    #[tokio::test]
    async fn test_fetch_columns_requires_connection() {
        let (_source, manager) = setup();
        let inspector = SchemaInspector::new(manager.clone());
        let table = LegacyTable::new("legacy", "dbo", "Customers");

        let err = inspector.fetch_columns("legacy", &table).await.unwrap_err();
        assert!(matches!(err, ImportError::Connectivity(_)));

        manager.test_connection("legacy").await;
        let columns = inspector.fetch_columns("legacy", &table).await.unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Id", "CustomerName", "Balance"]);
    }

    #[tokio::test]
    async fn test_fetch_columns_missing_table() {
        let (source, manager) = setup();
        manager.test_connection("legacy").await;
        source.drop_table("dbo", "Customers");

        let inspector = SchemaInspector::new(manager);
        let err = inspector
            .fetch_columns("legacy", &LegacyTable::new("legacy", "dbo", "Customers"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_inspect_table_caches_estimate() {
        let (_source, manager) = setup();
        manager.test_connection("legacy").await;
        manager.fetch_tables("legacy").await.unwrap();

        let inspector = SchemaInspector::new(manager.clone());
        let profile = inspector
            .inspect_table("legacy", &LegacyTable::new("legacy", "dbo", "Customers"))
            .await
            .unwrap();
        assert_eq!(profile.primary_key, vec!["Id".to_string()]);
        assert_eq!(profile.row_estimate, Some(1));
        assert!(profile.columns_text().contains("  Id int [PK]\n"));

        let cached = manager.get("legacy").unwrap();
        let entry = cached.tables.iter().find(|t| t.is("dbo", "Customers")).unwrap();
        assert_eq!(entry.row_estimate, Some(1));
    }

    #[tokio::test]
    async fn test_resolve_order_key() {
        let (source, _manager) = setup();
        assert_eq!(
            resolve_order_key(&source, "dbo", "Customers", None).await.unwrap(),
            "Id"
        );
        assert_eq!(
            resolve_order_key(&source, "dbo", "Customers", Some("Id"))
                .await
                .unwrap(),
            "Id"
        );
        assert!(matches!(
            resolve_order_key(&source, "dbo", "Customers", Some("Balance")).await,
            Err(ImportError::Precondition(_))
        ));
        assert!(matches!(
            resolve_order_key(&source, "dbo", "Log", None).await,
            Err(ImportError::Precondition(_))
        ));
        assert!(matches!(
            resolve_order_key(&source, "dbo", "Customers", Some("Nope")).await,
            Err(ImportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_order_key_must_be_unique_and_not_null() {
        let source = MemorySource::new("memory");
        let mut code = ColumnInfo::new("Code", "varchar");
        code.is_nullable = false;
        source.add_table(
            "dbo",
            "Vendors",
            vec![
                ColumnInfo::new("Id", "int"),
                code,
                ColumnInfo::new("Name", "nvarchar"),
                ColumnInfo::new("Email", "nvarchar"),
            ],
            Some("Id"),
        );

        let err = resolve_order_key(&source, "dbo", "Vendors", Some("Name"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Precondition(_)));
        assert!(err.to_string().contains("unique index"));

        source.add_unique_index("dbo", "Vendors", "Code");
        source.add_unique_index("dbo", "Vendors", "Email");
        assert_eq!(
            resolve_order_key(&source, "dbo", "Vendors", Some("Code"))
                .await
                .unwrap(),
            "Code"
        );
        let err = resolve_order_key(&source, "dbo", "Vendors", Some("Email"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("allows NULL"));
    }
}
