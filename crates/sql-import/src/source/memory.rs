//! In-process source for dry runs and tests.
//!
//! Tables live behind a shared handle, so a test can keep a clone and
//! change rows or reachability while the engine holds another. Row filters
//! are accepted but not evaluated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{
    ColumnInfo, ConnectionParams, KeyValue, ReadOptions, RowBatch, SourceConnector,
    SourceFactory, SourceRow, TableExtent, Value,
};
use crate::error::{ImportError, Result};

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<ColumnInfo>,
    primary_key: Option<String>,
    unique: Vec<String>,
    rows: Vec<Vec<(String, Value)>>,
}

#[derive(Debug, Default)]
struct Inner {
    version: String,
    unreachable: bool,
    tables: BTreeMap<(String, String), MemoryTable>,
}

/// Shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
    active_reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                version: version.into(),
                ..Default::default()
            })),
            active_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create or replace a table. Column ordinals are assigned in order.
    pub fn add_table(
        &self,
        schema: &str,
        table: &str,
        columns: Vec<ColumnInfo>,
        primary_key: Option<&str>,
    ) {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                c.ordinal = i as i32 + 1;
                c
            })
            .collect();
        if let Ok(mut inner) = self.inner.lock() {
            inner.tables.insert(
                (schema.to_string(), table.to_string()),
                MemoryTable {
                    columns,
                    primary_key: primary_key.map(str::to_string),
                    unique: Vec::new(),
                    rows: Vec::new(),
                },
            );
        }
    }

    /// Declare a single-column unique index.
    pub fn add_unique_index(&self, schema: &str, table: &str, column: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(t) = inner.tables.get_mut(&(schema.to_string(), table.to_string())) {
                t.unique.push(column.to_string());
            }
        }
    }

    /// Append a row; columns not given are NULL.
    pub fn insert_row(&self, schema: &str, table: &str, values: Vec<(&str, Value)>) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(t) = inner.tables.get_mut(&(schema.to_string(), table.to_string())) {
                let row = t
                    .columns
                    .iter()
                    .map(|c| {
                        let value = values
                            .iter()
                            .find(|(name, _)| *name == c.name)
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null);
                        (c.name.clone(), value)
                    })
                    .collect();
                t.rows.push(row);
            }
        }
    }

    pub fn drop_table(&self, schema: &str, table: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tables.remove(&(schema.to_string(), table.to_string()));
        }
    }

    /// Make every call fail as if the server were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unreachable = unreachable;
        }
    }

    /// Number of row streams still open.
    pub fn active_reads(&self) -> usize {
        self.active_reads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| ImportError::State("memory source lock poisoned".into()))?;
        if inner.unreachable {
            return Err(ImportError::Connectivity(
                "memory source is unreachable".into(),
            ));
        }
        Ok(inner)
    }

    fn sorted_rows(&self, opts: &ReadOptions) -> Result<Vec<SourceRow>> {
        let inner = self.lock()?;
        let table = table(&inner, &opts.schema, &opts.table)?;
        let key_idx = column_index(table, &opts)?;

        let mut rows = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let key = KeyValue::from_value(&row[key_idx].1).ok_or_else(|| {
                ImportError::Precondition(format!(
                    "ordering key {} is NULL or not orderable",
                    opts.key_column
                ))
            })?;
            if opts.after_key.as_ref().is_some_and(|after| key <= *after) {
                continue;
            }
            if opts.upto_key.as_ref().is_some_and(|upto| key > *upto) {
                continue;
            }
            let values = row
                .iter()
                .filter(|(name, _)| *name == opts.key_column || opts.columns.contains(name))
                .cloned()
                .collect();
            rows.push(SourceRow { key, values });
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }
}

fn table<'a>(inner: &'a Inner, schema: &str, name: &str) -> Result<&'a MemoryTable> {
    inner
        .tables
        .get(&(schema.to_string(), name.to_string()))
        .ok_or_else(|| ImportError::NotFound(format!("table {}.{}", schema, name)))
}

fn column_index(table: &MemoryTable, opts: &ReadOptions) -> Result<usize> {
    for col in &opts.columns {
        if !table.columns.iter().any(|c| &c.name == col) {
            return Err(ImportError::NotFound(format!(
                "column {}.{}.{}",
                opts.schema, opts.table, col
            )));
        }
    }
    table
        .columns
        .iter()
        .position(|c| c.name == opts.key_column)
        .ok_or_else(|| {
            ImportError::NotFound(format!(
                "column {}.{}.{}",
                opts.schema, opts.table, opts.key_column
            ))
        })
}

/// Decrements the open-stream count when the reader task ends.
struct ReadGuard(Arc<AtomicUsize>);

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceFactory for MemorySource {
    async fn connect(&self, _params: &ConnectionParams) -> Result<Arc<dyn SourceConnector>> {
        let _guard = self.lock()?;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    async fn server_version(&self) -> Result<String> {
        Ok(self.lock()?.version.clone())
    }

    async fn list_tables(&self) -> Result<Vec<(String, String)>> {
        Ok(self.lock()?.tables.keys().cloned().collect())
    }

    async fn list_columns(&self, schema: &str, name: &str) -> Result<Vec<ColumnInfo>> {
        let inner = self.lock()?;
        Ok(table(&inner, schema, name)?.columns.clone())
    }

    async fn primary_key(&self, schema: &str, name: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Ok(table(&inner, schema, name)?.primary_key.iter().cloned().collect())
    }

    async fn unique_columns(&self, schema: &str, name: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let table = table(&inner, schema, name)?;
        Ok(table
            .primary_key
            .iter()
            .chain(table.unique.iter())
            .cloned()
            .collect())
    }

    async fn estimate_rows(&self, schema: &str, name: &str) -> Result<Option<i64>> {
        let inner = self.lock()?;
        Ok(Some(table(&inner, schema, name)?.rows.len() as i64))
    }

    async fn extent(
        &self,
        schema: &str,
        name: &str,
        key_column: &str,
        _filter: Option<&str>,
    ) -> Result<TableExtent> {
        let rows = self.sorted_rows(&ReadOptions {
            schema: schema.to_string(),
            table: name.to_string(),
            key_column: key_column.to_string(),
            ..Default::default()
        })?;
        Ok(TableExtent {
            rows: rows.len() as u64,
            max_key: rows.last().map(|r| r.key.clone()),
        })
    }

    fn read_rows(&self, opts: ReadOptions) -> mpsc::Receiver<Result<RowBatch>> {
        let (tx, rx) = mpsc::channel(2);
        let source = self.clone();
        self.active_reads.fetch_add(1, Ordering::SeqCst);
        let guard = ReadGuard(self.active_reads.clone());

        tokio::spawn(async move {
            let _guard = guard;
            let rows = match source.sorted_rows(&opts) {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            let mut rows = rows.into_iter().peekable();
            while rows.peek().is_some() {
                let page: RowBatch = rows.by_ref().take(opts.batch_size.max(1)).collect();
                if tx.send(Ok(page)).await.is_err() {
                    return;
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MemorySource {
        let source = MemorySource::new("memory");
        source.add_table(
            "dbo",
            "Customers",
            vec![ColumnInfo::new("Id", "int"), ColumnInfo::new("Name", "nvarchar")],
            Some("Id"),
        );
        for (id, name) in [(3, "c"), (1, "a"), (2, "b")] {
            source.insert_row("dbo", "Customers", vec![("Id", Value::Int(id)), ("Name", name.into())]);
        }
        source
    }

    fn opts() -> ReadOptions {
        ReadOptions {
            table: "Customers".to_string(),
            columns: vec!["Name".to_string()],
            key_column: "Id".to_string(),
            batch_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_rows_pages_in_key_order() {
        let source = source();
        let mut rx = source.read_rows(opts());

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].key, KeyValue::Int(1));
        assert_eq!(first[0].get("Name"), Some(&Value::from("a")));
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key, KeyValue::Int(3));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_rows_honors_key_bounds() {
        let source = source();
        let mut rx = source.read_rows(ReadOptions {
            after_key: Some(KeyValue::Int(1)),
            upto_key: Some(KeyValue::Int(2)),
            ..opts()
        });
        let page = rx.recv().await.unwrap().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, KeyValue::Int(2));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_receiver_releases_stream() {
        let source = source();
        let rx = source.read_rows(ReadOptions {
            batch_size: 1,
            ..opts()
        });
        drop(rx);
        for _ in 0..50 {
            if source.active_reads() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(source.active_reads(), 0);
    }

    #[tokio::test]
    async fn test_extent_and_missing_table() {
        let source = source();
        let extent = source.extent("dbo", "Customers", "Id", None).await.unwrap();
        assert_eq!(extent.rows, 3);
        assert_eq!(extent.max_key, Some(KeyValue::Int(3)));

        let err = source.list_columns("dbo", "Vendors").await.unwrap_err();
        assert!(matches!(err, ImportError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unreachable_fails_connect() {
        let source = source();
        source.set_unreachable(true);
        let params = ConnectionParams {
            server: "db1".into(),
            port: 1433,
            database: "legacy".into(),
            username: "sa".into(),
            password: "pw".into(),
            timeout_secs: 1,
            trust_server_certificate: false,
        };
        let err = source.connect(&params).await.err().unwrap();
        assert!(err.is_connectivity());
    }
}
