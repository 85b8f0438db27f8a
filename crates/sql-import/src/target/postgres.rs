//! PostgreSQL target over deadpool-postgres.
//!
//! An entity name maps to a table in the configured schema with dots
//! replaced by underscores (`res.partner` is `public.res_partner`). Values
//! are bound as text and cast to each column's type in SQL, so the server
//! does the final coercion. Every write autocommits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::PostgresTargetConfig;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::{EntityId, FieldInfo, FieldType, Record, TargetMode, TargetModel, Value};
use crate::error::{ImportError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Column metadata needed to bind values.
#[derive(Debug, Clone)]
struct PgColumn {
    info: FieldInfo,
    udt_name: String,
}

/// Writes records into PostgreSQL tables.
pub struct PgTarget {
    pool: Pool,
    schema: String,
    id_column: String,
    columns: Mutex<HashMap<String, Vec<PgColumn>>>,
}

impl PgTarget {
    /// Create the pool and check one connection out.
    pub async fn connect(config: &PostgresTargetConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| ImportError::pool(e, "creating PostgreSQL target pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| ImportError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            schema: config.schema.clone(),
            id_column: config.id_column.clone(),
            columns: Mutex::new(HashMap::new()),
        })
    }

    /// Table name for an entity.
    pub fn table_name(entity: &str) -> String {
        entity.replace('.', "_")
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ImportError::pool(e, "getting PostgreSQL connection"))
    }

    async fn load_columns(&self, entity: &str) -> Result<Vec<PgColumn>> {
        if let Some(cached) = self.columns.lock().ok().and_then(|c| c.get(entity).cloned()) {
            return Ok(cached);
        }

        let table = Self::table_name(entity);
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT column_name::text,
                       data_type::text,
                       udt_name::text,
                       is_nullable = 'NO',
                       column_default IS NOT NULL,
                       is_identity = 'YES',
                       is_generated = 'ALWAYS'
                FROM information_schema.columns
                WHERE table_schema = $1 AND table_name = $2
                ORDER BY ordinal_position
                "#,
                &[&self.schema, &table],
            )
            .await?;

        if rows.is_empty() {
            return Err(ImportError::NotFound(format!(
                "entity {} (table {}.{})",
                entity, self.schema, table
            )));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0);
            let data_type: String = row.get(1);
            let udt_name: String = row.get(2);
            let not_null: bool = row.get(3);
            let has_default: bool = row.get(4);
            let identity: bool = row.get(5);
            let generated: bool = row.get(6);

            let readonly = generated || identity || name == self.id_column;
            let required = not_null && !has_default && !readonly;
            let mut info = FieldInfo::new(name, field_type(&data_type), required);
            info.readonly = readonly;
            columns.push(PgColumn { info, udt_name });
        }

        debug!("Loaded {} fields for entity {}", columns.len(), entity);
        if let Ok(mut cache) = self.columns.lock() {
            cache.insert(entity.to_string(), columns.clone());
        }
        Ok(columns)
    }

    /// Find the ids of records whose `field` equals `value`, at most two.
    async fn lookup(
        &self,
        client: &Object,
        table: &str,
        column: &PgColumn,
        value: &Value,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {}::text FROM {} WHERE {} = $1::text::{} LIMIT 2",
            quote_pg(&self.id_column)?,
            table,
            quote_pg(&column.info.name)?,
            quote_pg(&column.udt_name)?
        );
        let param = value.render_text();
        let rows = client
            .query(sql.as_str(), &[&param])
            .await
            .map_err(write_error)?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn insert(
        &self,
        client: &Object,
        table: &str,
        bound: &[(&PgColumn, Option<String>)],
    ) -> Result<EntityId> {
        let returning = quote_pg(&self.id_column)?;
        let sql = if bound.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES RETURNING {}::text", table, returning)
        } else {
            let cols = bound
                .iter()
                .map(|(c, _)| quote_pg(&c.info.name))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            let placeholders = bound
                .iter()
                .enumerate()
                .map(|(i, (c, _))| Ok(format!("${}::text::{}", i + 1, quote_pg(&c.udt_name)?)))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}::text",
                table, cols, placeholders, returning
            )
        };

        let params: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|(_, v)| v as &(dyn ToSql + Sync))
            .collect();
        let row = client
            .query_one(sql.as_str(), &params)
            .await
            .map_err(write_error)?;
        Ok(EntityId(row.get(0)))
    }

    async fn update(
        &self,
        client: &Object,
        table: &str,
        id: String,
        bound: &[(&PgColumn, Option<String>)],
    ) -> Result<EntityId> {
        if bound.is_empty() {
            return Ok(EntityId(id));
        }

        let assignments = bound
            .iter()
            .enumerate()
            .map(|(i, (c, _))| {
                Ok(format!(
                    "{} = ${}::text::{}",
                    quote_pg(&c.info.name)?,
                    i + 1,
                    quote_pg(&c.udt_name)?
                ))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {}::text = ${}",
            table,
            assignments,
            quote_pg(&self.id_column)?,
            bound.len() + 1
        );

        let mut params: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|(_, v)| v as &(dyn ToSql + Sync))
            .collect();
        params.push(&id);
        client
            .execute(sql.as_str(), &params)
            .await
            .map_err(write_error)?;
        Ok(EntityId(id))
    }
}

#[async_trait]
impl TargetModel for PgTarget {
    async fn list_fields(&self, entity: &str) -> Result<Vec<FieldInfo>> {
        Ok(self
            .load_columns(entity)
            .await?
            .into_iter()
            .map(|c| c.info)
            .collect())
    }

    async fn write(
        &self,
        entity: &str,
        mode: TargetMode,
        key: Option<(&str, &Value)>,
        values: &Record,
    ) -> Result<EntityId> {
        let columns = self.load_columns(entity).await?;

        let mut bound = Vec::with_capacity(values.len());
        for (name, value) in values.iter() {
            let col = find_column(&columns, entity, name)?;
            if col.info.readonly {
                return Err(ImportError::Write(format!(
                    "field {}.{} is read-only",
                    entity, name
                )));
            }
            bound.push((col, value.render_text()));
        }

        let table = qualify_pg(&self.schema, &Self::table_name(entity))?;
        let client = self.client().await?;

        if mode == TargetMode::CreateOnly {
            return self.insert(&client, &table, &bound).await;
        }

        let (field, value) =
            key.ok_or_else(|| ImportError::Write(format!("{} requires a key field", mode)))?;
        let column = find_column(&columns, entity, field)?;
        let mut ids = self.lookup(&client, &table, column, value).await?;
        if ids.len() > 1 {
            return Err(ImportError::Write(format!(
                "more than one {} record has {} = {}",
                entity, field, value
            )));
        }

        match ids.pop() {
            Some(id) => self.update(&client, &table, id, &bound).await,
            None if mode.may_create() => self.insert(&client, &table, &bound).await,
            None => {
                warn!("No {} record with {} = {}", entity, field, value);
                Err(ImportError::Write(format!(
                    "no {} record with {} = {}",
                    entity, field, value
                )))
            }
        }
    }

    fn kind(&self) -> &str {
        "postgres"
    }
}

fn find_column<'a>(columns: &'a [PgColumn], entity: &str, name: &str) -> Result<&'a PgColumn> {
    columns
        .iter()
        .find(|c| c.info.name == name)
        .ok_or_else(|| ImportError::Write(format!("{} has no field {}", entity, name)))
}

/// Database rejections are row-scoped; transport failures are not.
fn write_error(e: tokio_postgres::Error) -> ImportError {
    match e.as_db_error() {
        Some(db) => ImportError::Write(db.message().to_string()),
        None => ImportError::Target(e),
    }
}

fn field_type(data_type: &str) -> FieldType {
    match data_type {
        "boolean" => FieldType::Boolean,
        "smallint" | "integer" | "bigint" => FieldType::Integer,
        "real" | "double precision" => FieldType::Float,
        "character varying" | "character" => FieldType::Char,
        "text" => FieldType::Text,
        "date" => FieldType::Date,
        t if t.starts_with("timestamp") => FieldType::DateTime,
        other => FieldType::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_from_entity() {
        assert_eq!(PgTarget::table_name("res.partner"), "res_partner");
        assert_eq!(PgTarget::table_name("customers"), "customers");
    }

    #[test]
    fn test_field_type_mapping() {
        assert_eq!(field_type("boolean"), FieldType::Boolean);
        assert_eq!(field_type("bigint"), FieldType::Integer);
        assert_eq!(field_type("double precision"), FieldType::Float);
        assert_eq!(field_type("numeric"), FieldType::Other("numeric".to_string()));
        assert_eq!(field_type("character varying"), FieldType::Char);
        assert_eq!(field_type("timestamp without time zone"), FieldType::DateTime);
        assert_eq!(field_type("jsonb"), FieldType::Other("jsonb".to_string()));
    }
}
