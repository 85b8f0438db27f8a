//! SQL Server source over Tiberius with bb8 connection pooling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::identifier::{qualify_mssql, quote_mssql, validate_filter};
use crate::core::{
    ColumnInfo, ConnectionParams, KeyValue, ReadOptions, RowBatch, SourceConnector,
    SourceFactory, SourceRow, TableExtent, Value,
};
use crate::error::{ImportError, Result};

/// Idle connection timeout (5 minutes).
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum connection lifetime (30 minutes).
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Sessions per connection: one streaming cursor plus catalog queries.
const POOL_MAX_SIZE: u32 = 4;

/// Pages buffered ahead of the consumer.
const READ_AHEAD_PAGES: usize = 2;

type TdsClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    params: ConnectionParams,
}

impl TiberiusConnectionManager {
    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.params.server);
        config.port(self.params.port);
        config.database(&self.params.database);
        config.authentication(AuthMethod::sql_server(
            &self.params.username,
            &self.params.password,
        ));
        if self.params.trust_server_certificate {
            config.trust_cert();
        }
        config.encryption(EncryptionLevel::Required);
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;
        tcp.set_nodelay(true).ok();
        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Opens pooled SQL Server sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlSourceFactory;

#[async_trait]
impl SourceFactory for MssqlSourceFactory {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn SourceConnector>> {
        Ok(Arc::new(MssqlSource::connect(params.clone()).await?))
    }
}

/// A pooled session against one SQL Server database.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlSource {
    /// Build the pool and check one session out to prove the credentials.
    pub async fn connect(params: ConnectionParams) -> Result<Self> {
        let target = format!("{}:{}/{}", params.server, params.port, params.database);
        let timeout = Duration::from_secs(params.timeout_secs);
        let manager = TiberiusConnectionManager { params };

        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .connection_timeout(timeout)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| ImportError::Connectivity(format!("{}: {}", target, e)))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| ImportError::Connectivity(format!("{}: {}", target, e)))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!("Connected to MSSQL: {}", target);
        Ok(Self { pool })
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| ImportError::pool(e, "getting MSSQL connection from pool"))
    }
}

#[async_trait]
impl SourceConnector for MssqlSource {
    async fn server_version(&self) -> Result<String> {
        let mut client = self.get_client().await?;
        let row = client
            .simple_query("SELECT @@VERSION")
            .await?
            .into_row()
            .await?;
        Ok(row
            .and_then(|r| r.try_get::<&str, _>(0).ok().flatten().map(str::to_string))
            .unwrap_or_default())
    }

    async fn list_tables(&self) -> Result<Vec<(String, String)>> {
        let mut client = self.get_client().await?;
        let query = r#"
            SELECT TABLE_SCHEMA, TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_SCHEMA, TABLE_NAME
        "#;
        let rows = client.simple_query(query).await?.into_first_result().await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: &str = row.try_get(0)?.unwrap_or_default();
            let table: &str = row.try_get(1)?.unwrap_or_default();
            tables.push((schema.to_string(), table.to_string()));
        }
        debug!("Listed {} tables", tables.len());
        Ok(tables)
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut client = self.get_client().await?;
        let columns = load_columns(&mut client, schema, table).await?;
        if columns.is_empty() {
            return Err(ImportError::NotFound(format!("table {}.{}", schema, table)));
        }
        debug!("Loaded {} columns for {}.{}", columns.len(), schema, table);
        Ok(columns)
    }

    async fn primary_key(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let mut client = self.get_client().await?;
        let query = r#"
            SELECT c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(schema);
        query.bind(table);
        let rows = query.query(&mut *client).await?.into_first_result().await?;

        let mut key = Vec::with_capacity(rows.len());
        for row in rows {
            let col: &str = row.try_get(0)?.unwrap_or_default();
            key.push(col.to_string());
        }
        Ok(key)
    }

    async fn unique_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let mut client = self.get_client().await?;
        let query = r#"
            SELECT c.name
            FROM sys.indexes i
            JOIN sys.tables t ON t.object_id = i.object_id
            JOIN sys.schemas s ON s.schema_id = t.schema_id
            JOIN sys.index_columns ic
                ON ic.object_id = i.object_id AND ic.index_id = i.index_id
            JOIN sys.columns c
                ON c.object_id = ic.object_id AND c.column_id = ic.column_id
            WHERE s.name = @P1 AND t.name = @P2
              AND i.is_unique = 1
              AND i.has_filter = 0
              AND ic.is_included_column = 0
              AND (
                  SELECT COUNT(*)
                  FROM sys.index_columns k
                  WHERE k.object_id = i.object_id
                    AND k.index_id = i.index_id
                    AND k.is_included_column = 0
              ) = 1
            ORDER BY i.index_id
        "#;

        let mut query = Query::new(query);
        query.bind(schema);
        query.bind(table);
        let rows = query.query(&mut *client).await?.into_first_result().await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let col: &str = row.try_get(0)?.unwrap_or_default();
            columns.push(col.to_string());
        }
        Ok(columns)
    }

    async fn estimate_rows(&self, schema: &str, table: &str) -> Result<Option<i64>> {
        let mut client = self.get_client().await?;
        let query = r#"
            SELECT CAST(SUM(p.rows) AS BIGINT)
            FROM sys.partitions p
            JOIN sys.tables t ON p.object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2 AND p.index_id IN (0, 1)
        "#;

        let mut query = Query::new(query);
        query.bind(schema);
        query.bind(table);
        let row = query.query(&mut *client).await?.into_row().await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>(0)?),
            None => Ok(None),
        }
    }

    async fn extent(
        &self,
        schema: &str,
        table: &str,
        key_column: &str,
        filter: Option<&str>,
    ) -> Result<TableExtent> {
        let mut client = self.get_client().await?;
        let columns = load_columns(&mut client, schema, table).await?;
        let key = columns
            .iter()
            .find(|c| c.name == key_column)
            .ok_or_else(|| {
                ImportError::NotFound(format!("column {}.{}.{}", schema, table, key_column))
            })?;

        let mut sql = format!(
            "SELECT CAST(COUNT_BIG(*) AS BIGINT), MAX({}) FROM {}",
            quote_mssql(key_column)?,
            qualify_mssql(schema, table)?
        );
        if let Some(filter) = filter {
            validate_filter(filter)?;
            sql.push_str(&format!(" WHERE ({})", filter));
        }

        let row = client.simple_query(sql).await?.into_row().await?;
        let Some(row) = row else {
            return Ok(TableExtent::default());
        };
        let rows = row.try_get::<i64, _>(0)?.unwrap_or(0);
        let max_key = KeyValue::from_value(&convert_row_value(&row, 1, &key.declared_type)?);

        Ok(TableExtent {
            rows: rows.max(0) as u64,
            max_key,
        })
    }

    fn read_rows(&self, opts: ReadOptions) -> mpsc::Receiver<Result<RowBatch>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD_PAGES);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            if let Err(e) = read_rows_internal(pool, opts, tx.clone()).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn close(&self) {
        // bb8 closes idle sessions when the pool is dropped
    }
}

/// Columns of one table in ordinal order; empty when the table does not exist.
async fn load_columns(client: &mut TdsClient, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
    let query = r#"
        SELECT
            COLUMN_NAME,
            DATA_TYPE,
            CAST(CHARACTER_MAXIMUM_LENGTH AS INT),
            CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END,
            ORDINAL_POSITION
        FROM INFORMATION_SCHEMA.COLUMNS
        WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
        ORDER BY ORDINAL_POSITION
    "#;

    let mut query = Query::new(query);
    query.bind(schema);
    query.bind(table);
    let rows = query.query(client).await?.into_first_result().await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        columns.push(ColumnInfo {
            name: row.try_get::<&str, _>(0)?.unwrap_or_default().to_string(),
            declared_type: row.try_get::<&str, _>(1)?.unwrap_or_default().to_string(),
            max_length: row.try_get::<i32, _>(2)?,
            is_nullable: row.try_get::<i32, _>(3)?.unwrap_or(0) == 1,
            ordinal: row.try_get::<i32, _>(4)?.unwrap_or(0),
        });
    }
    Ok(columns)
}

fn bind_key(query: &mut Query<'_>, key: &KeyValue) {
    match key {
        KeyValue::Int(v) => query.bind(*v),
        KeyValue::Uuid(v) => query.bind(*v),
        KeyValue::Text(v) => query.bind(v.clone()),
    }
}

/// Stream pages in key order over one checked-out session.
async fn read_rows_internal(
    pool: Pool<TiberiusConnectionManager>,
    opts: ReadOptions,
    tx: mpsc::Sender<Result<RowBatch>>,
) -> Result<()> {
    let mut client = pool
        .get()
        .await
        .map_err(|e| ImportError::pool(e, "getting connection for read_rows"))?;

    let table_columns = load_columns(&mut client, &opts.schema, &opts.table).await?;
    if table_columns.is_empty() {
        return Err(ImportError::NotFound(format!(
            "table {}.{}",
            opts.schema, opts.table
        )));
    }

    let mut selected: Vec<&ColumnInfo> = Vec::with_capacity(opts.columns.len() + 1);
    for name in opts.columns.iter().chain(std::iter::once(&opts.key_column)) {
        if selected.iter().any(|c| &c.name == name) {
            continue;
        }
        let col = table_columns.iter().find(|c| &c.name == name).ok_or_else(|| {
            ImportError::NotFound(format!("column {}.{}.{}", opts.schema, opts.table, name))
        })?;
        selected.push(col);
    }
    let key_idx = selected
        .iter()
        .position(|c| c.name == opts.key_column)
        .unwrap_or(selected.len() - 1);

    let cols = selected
        .iter()
        .map(|c| quote_mssql(&c.name))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let table = qualify_mssql(&opts.schema, &opts.table)?;
    let key_col = quote_mssql(&opts.key_column)?;
    if let Some(filter) = &opts.filter {
        validate_filter(filter)?;
    }

    let batch_size = opts.batch_size.max(1);
    let mut after = opts.after_key.clone();

    loop {
        // @P1 is the page size; key bounds follow in order.
        let mut conditions = Vec::new();
        let mut next_param = 2;
        if after.is_some() {
            conditions.push(format!("{} > @P{}", key_col, next_param));
            next_param += 1;
        }
        if opts.upto_key.is_some() {
            conditions.push(format!("{} <= @P{}", key_col, next_param));
        }
        if let Some(filter) = &opts.filter {
            conditions.push(format!("({})", filter));
        }

        let mut sql = format!("SELECT TOP (@P1) {} FROM {}", cols, table);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {}", key_col));

        let mut query = Query::new(sql);
        query.bind(batch_size as i64);
        if let Some(key) = &after {
            bind_key(&mut query, key);
        }
        if let Some(key) = &opts.upto_key {
            bind_key(&mut query, key);
        }

        let rows = query.query(&mut *client).await?.into_first_result().await?;
        let fetched = rows.len();
        if fetched == 0 {
            break;
        }

        let mut batch = Vec::with_capacity(fetched);
        for row in rows {
            let mut values = Vec::with_capacity(selected.len());
            for (idx, col) in selected.iter().enumerate() {
                values.push((col.name.clone(), convert_row_value(&row, idx, &col.declared_type)?));
            }
            let key = KeyValue::from_value(&values[key_idx].1).ok_or_else(|| {
                ImportError::Precondition(format!(
                    "ordering key {} is NULL or not orderable",
                    opts.key_column
                ))
            })?;
            batch.push(SourceRow { key, values });
        }

        after = batch.last().map(|r| r.key.clone());
        if tx.send(Ok(batch)).await.is_err() {
            debug!("Row consumer for {}.{} went away", opts.schema, opts.table);
            break;
        }
        if fetched < batch_size {
            break;
        }
    }

    Ok(())
}

/// Convert a column to a [`Value`] based on its declared type.
fn convert_row_value(row: &Row, idx: usize, data_type: &str) -> Result<Value> {
    let dt = data_type.to_lowercase();

    let value = match dt.as_str() {
        "bit" => row.try_get::<bool, _>(idx)?.map(Value::Bool),
        "tinyint" => row.try_get::<u8, _>(idx)?.map(|v| Value::Int(v as i64)),
        "smallint" => row.try_get::<i16, _>(idx)?.map(|v| Value::Int(v as i64)),
        "int" => row.try_get::<i32, _>(idx)?.map(|v| Value::Int(v as i64)),
        "bigint" => row.try_get::<i64, _>(idx)?.map(Value::Int),
        "real" => row.try_get::<f32, _>(idx)?.map(|v| Value::Float(v as f64)),
        "float" => row.try_get::<f64, _>(idx)?.map(Value::Float),
        "decimal" | "numeric" | "money" | "smallmoney" => row
            .try_get::<rust_decimal::Decimal, _>(idx)?
            .map(Value::Decimal),
        "uniqueidentifier" => row.try_get::<Uuid, _>(idx)?.map(Value::Uuid),
        "date" => row.try_get::<NaiveDate, _>(idx)?.map(Value::Date),
        "time" => row.try_get::<NaiveTime, _>(idx)?.map(Value::Time),
        "datetime" | "datetime2" | "smalldatetime" => {
            row.try_get::<NaiveDateTime, _>(idx)?.map(Value::DateTime)
        }
        "datetimeoffset" => row
            .try_get::<DateTime<FixedOffset>, _>(idx)?
            .map(Value::DateTimeOffset),
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => row
            .try_get::<&[u8], _>(idx)?
            .map(|v| Value::Bytes(v.to_vec())),
        _ => row
            .try_get::<&str, _>(idx)?
            .map(|s| Value::Text(s.to_string())),
    };

    Ok(value.unwrap_or(Value::Null))
}
