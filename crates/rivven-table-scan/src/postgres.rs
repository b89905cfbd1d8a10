//! PostgreSQL backend for rivven-table-scan
//!
//! Provides:
//! - [`PgConnection`]: parameterized reads over tokio-postgres
//! - [`PgConnectionFactory`]: creates connections for the pool
//! - [`PgSchemaProvider`]: catalog queries for table resolution
//! - [`open_source`]: pool, table resolution and source from one config

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, warn};

use crate::config::TableScanConfig;
use crate::connection::{redact_url, Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::coordinator::TableScanSource;
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, SimpleConnectionPool};
use crate::schema::{ForeignKeyMetadata, SchemaProvider};
use crate::security::escape_string_literal;
use crate::types::{ColumnMetadata, Row, TableMetadata, Value};

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Convert a Value to a tokio-postgres parameter
fn value_to_sql(value: &Value) -> SqlParam {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int8(n) => Box::new(i16::from(*n)),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
    }
}

fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let mut columns = Vec::with_capacity(pg_row.len());
    let mut values = Vec::with_capacity(pg_row.len());
    for (idx, col) in pg_row.columns().iter().enumerate() {
        columns.push(col.name().to_string());
        values.push(pg_value_to_value(pg_row, idx, col.type_())?);
    }
    Ok(Row::new(columns, values))
}

fn get<'a, T, F>(row: &'a tokio_postgres::Row, idx: usize, wrap: F) -> Result<Value>
where
    T: tokio_postgres::types::FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    row.try_get::<_, Option<T>>(idx)
        .map(|v| v.map_or(Value::Null, wrap))
        .map_err(|e| Error::type_conversion(format!("column {}: {}", idx, e)))
}

fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    match *pg_type {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::INT2 => get(row, idx, Value::Int16),
        Type::INT4 => get(row, idx, Value::Int32),
        Type::INT8 => get(row, idx, Value::Int64),
        Type::FLOAT4 => get(row, idx, Value::Float32),
        Type::FLOAT8 => get(row, idx, Value::Float64),
        Type::NUMERIC => get(row, idx, Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get(row, idx, Value::String),
        Type::BYTEA => get(row, idx, Value::Bytes),
        Type::DATE => get(row, idx, Value::Date),
        Type::TIME => get(row, idx, Value::Time),
        Type::TIMESTAMP => get(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, Value::DateTimeTz),
        Type::UUID => get(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx, Value::Json),
        // citext, enums and other text-like types
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => Ok(v.map_or(Value::Null, Value::String)),
            Err(_) => Err(Error::type_conversion(format!(
                "unsupported PostgreSQL type '{}' in column '{}'",
                pg_type.name(),
                row.columns()[idx].name()
            ))),
        },
    }
}

/// PostgreSQL connection
pub struct PgConnection {
    client: tokio_postgres::Client,
    closed: AtomicBool,
}

impl PgConnection {
    /// Wrap a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }

        let boxed: Vec<SqlParam> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let pg_rows = self.client.query(sql, &refs).await.map_err(|e| {
            if e.is_closed() {
                Error::connection_with_source("connection lost during query", e)
            } else {
                Error::query_with_sql(e.to_string(), sql)
            }
        })?;

        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::config(format!("invalid PostgreSQL URL: {}", e)))?;
        pg.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(app) = &config.application_name {
            pg.application_name(app);
        }

        let (client, connection) = pg
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        let url = redact_url(&config.url);
        debug!(url = %url, "PostgreSQL connection established");
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(url = %url, error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

/// PostgreSQL schema provider
pub struct PgSchemaProvider {
    pool: Arc<dyn ConnectionPool>,
    dialect: PostgresDialect,
}

impl PgSchemaProvider {
    /// Create a schema provider that borrows connections from `pool`
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            pool,
            dialect: PostgresDialect,
        }
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let conn = self.pool.get().await?;
        conn.query(sql, &[]).await
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get_by_name(column).and_then(Value::as_string)
}

fn int(row: &Row, column: &str) -> Option<i64> {
    row.get_by_name(column).and_then(Value::as_i64)
}

#[async_trait]
impl SchemaProvider for PgSchemaProvider {
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableMetadata>> {
        let rows = self.query(&self.dialect.list_tables_sql(schema)).await?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                let name = text(r, "table_name")?;
                let mut meta = TableMetadata::new(name);
                meta.schema = text(r, "table_schema");
                meta.estimated_rows = int(r, "estimated_rows").map(|n| n.max(0) as u64);
                Some(meta)
            })
            .collect())
    }

    async fn get_table(&self, schema: Option<&str>, table: &str) -> Result<Option<TableMetadata>> {
        let schema = schema.unwrap_or("public");
        let rows = self
            .query(&self.dialect.list_columns_sql(Some(schema), table))
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut meta = TableMetadata::new(table).with_schema(schema);
        for row in &rows {
            let name = text(row, "column_name")
                .ok_or_else(|| Error::schema(format!("column without name in {}", table)))?;
            let mut col = ColumnMetadata::new(name, text(row, "data_type").unwrap_or_default())
                .with_nullable(
                    row.get_by_name("nullable")
                        .and_then(Value::as_bool)
                        .unwrap_or(true),
                )
                .with_ordinal(int(row, "ordinal_position").unwrap_or(0) as u32);
            col.primary_key_ordinal = int(row, "pk_ordinal").map(|n| n as u32);
            meta.columns.push(col);
        }

        Ok(Some(meta))
    }

    async fn list_foreign_keys(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyMetadata>> {
        let schema = schema.unwrap_or("public");
        let sql = format!(
            r#"SELECT
                con.conname::text AS constraint_name,
                tn.nspname::text AS target_schema,
                tc.relname::text AS target_table,
                sa.attname::text AS source_column,
                ta.attname::text AS target_column
            FROM pg_catalog.pg_constraint con
            JOIN pg_catalog.pg_class sc ON sc.oid = con.conrelid
            JOIN pg_catalog.pg_namespace sn ON sn.oid = sc.relnamespace
            JOIN pg_catalog.pg_class tc ON tc.oid = con.confrelid
            JOIN pg_catalog.pg_namespace tn ON tn.oid = tc.relnamespace
            CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(src, dst, pos)
            JOIN pg_catalog.pg_attribute sa ON sa.attrelid = con.conrelid AND sa.attnum = k.src
            JOIN pg_catalog.pg_attribute ta ON ta.attrelid = con.confrelid AND ta.attnum = k.dst
            WHERE con.contype = 'f'
                AND sn.nspname = '{}'
                AND sc.relname = '{}'
            ORDER BY con.conname, k.pos"#,
            escape_string_literal(schema),
            escape_string_literal(table)
        );
        let rows = self.query(&sql).await?;

        let mut fks: Vec<ForeignKeyMetadata> = Vec::new();
        for row in &rows {
            let (Some(name), Some(target_table)) =
                (text(row, "constraint_name"), text(row, "target_table"))
            else {
                continue;
            };

            let idx = match fks.iter().position(|fk| fk.name == name) {
                Some(idx) => idx,
                None => {
                    let mut fk = ForeignKeyMetadata::new(name, table, target_table);
                    fk.source_schema = Some(schema.to_string());
                    fk.target_schema = text(row, "target_schema");
                    fks.push(fk);
                    fks.len() - 1
                }
            };
            if let (Some(src), Some(dst)) = (text(row, "source_column"), text(row, "target_column"))
            {
                fks[idx].source_columns.push(src);
                fks[idx].target_columns.push(dst);
            }
        }

        Ok(fks)
    }
}

/// Build a [`TableScanSource`] for a PostgreSQL database from a config
pub async fn open_source(config: &TableScanConfig) -> Result<TableScanSource> {
    config.check()?;
    let pool: Arc<dyn ConnectionPool> =
        SimpleConnectionPool::new(config.pool_config(), Arc::new(PgConnectionFactory)).await?;
    let schema = PgSchemaProvider::new(Arc::clone(&pool));
    TableScanSource::from_config(config, pool, Box::new(PostgresDialect), &schema).await
}
