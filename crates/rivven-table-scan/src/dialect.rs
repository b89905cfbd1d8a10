//! SQL dialect abstraction for rivven-table-scan
//!
//! Scan queries are plain `SELECT ... WHERE ... ORDER BY ... LIMIT n`
//! statements. PostgreSQL and MySQL are rendered with sea-query; SQL Server
//! has no sea-query backend and uses `SELECT TOP (n)` built by hand.
//!
//! - SqlDialect: identifier quoting, placeholders, SELECT assembly
//! - Catalog queries used for table discovery

use crate::security::escape_string_literal;
use sea_query::{
    Alias, Asterisk, Expr, IntoIden, MysqlQueryBuilder, Order, PostgresQueryBuilder, Query,
    SelectStatement, TableRef,
};

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

fn sea_select(
    schema: Option<&str>,
    table: &str,
    columns: &[&str],
    where_clause: Option<&str>,
    order_by: &[(&str, bool)],
    limit: Option<u64>,
) -> SelectStatement {
    let mut stmt = Query::select();
    stmt.from(sea_table_ref(schema, table));

    if columns.is_empty() {
        stmt.column(Asterisk);
    } else {
        for col in columns {
            stmt.column(Alias::new(*col));
        }
    }

    if let Some(w) = where_clause {
        stmt.and_where(Expr::cust(w));
    }

    for (col, asc) in order_by {
        stmt.order_by(
            Alias::new(*col),
            if *asc { Order::Asc } else { Order::Desc },
        );
    }

    if let Some(l) = limit {
        stmt.limit(l);
    }

    stmt
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a 1-based parameter index (e.g., $1, ?, @p1)
    fn placeholder(&self, index: usize) -> String;

    /// Whether a numbered placeholder may appear more than once in a
    /// statement and bind the same parameter each time.
    fn supports_numbered_placeholders(&self) -> bool {
        true
    }

    /// Quoted, schema-qualified table reference
    fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// SQL listing base tables of a schema as
    /// `(table_schema, table_name, estimated_rows)`
    fn list_tables_sql(&self, schema: Option<&str>) -> String;

    /// SQL listing the columns of a table as
    /// `(column_name, data_type, nullable, ordinal_position, pk_ordinal)`
    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Build a SELECT statement. `where_clause` is inserted verbatim.
    fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: &[(&str, bool)],
        limit: Option<u64>,
    ) -> String;
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn list_tables_sql(&self, schema: Option<&str>) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        format!(
            r#"SELECT
                n.nspname::text AS table_schema,
                c.relname::text AS table_name,
                GREATEST(c.reltuples, 0)::bigint AS estimated_rows
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p')
                AND n.nspname = '{}'
            ORDER BY c.relname"#,
            schema
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable = 'YES' AS nullable,
                c.ordinal_position::int AS ordinal_position,
                pk.ordinal_position::int AS pk_ordinal
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                    AND tc.table_name = ku.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = '{}'
                    AND tc.table_name = '{}'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = '{}' AND c.table_name = '{}'
            ORDER BY c.ordinal_position"#,
            schema, table, schema, table
        )
    }

    fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: &[(&str, bool)],
        limit: Option<u64>,
    ) -> String {
        sea_select(schema, table, columns, where_clause, order_by, limit)
            .to_string(PostgresQueryBuilder)
    }
}

// ===========================================================================
// MySQL / MariaDB
// ===========================================================================

/// MySQL dialect (also used for MariaDB)
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn supports_numbered_placeholders(&self) -> bool {
        false
    }

    fn list_tables_sql(&self, schema: Option<&str>) -> String {
        let schema_filter = match schema {
            Some(s) => format!("'{}'", escape_string_literal(s)),
            None => "DATABASE()".to_string(),
        };
        format!(
            r#"SELECT
                table_schema,
                table_name,
                table_rows AS estimated_rows
            FROM information_schema.tables
            WHERE table_type = 'BASE TABLE'
                AND table_schema = {}
            ORDER BY table_name"#,
            schema_filter
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema_filter = match schema {
            Some(s) => format!("'{}'", escape_string_literal(s)),
            None => "DATABASE()".to_string(),
        };
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name,
                c.data_type,
                c.is_nullable = 'YES' as nullable,
                c.ordinal_position,
                k.ordinal_position as pk_ordinal
            FROM information_schema.columns c
            LEFT JOIN information_schema.key_column_usage k
                ON k.table_schema = c.table_schema
                AND k.table_name = c.table_name
                AND k.column_name = c.column_name
                AND k.constraint_name = 'PRIMARY'
            WHERE c.table_schema = {} AND c.table_name = '{}'
            ORDER BY c.ordinal_position"#,
            schema_filter, table
        )
    }

    fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: &[(&str, bool)],
        limit: Option<u64>,
    ) -> String {
        sea_select(schema, table, columns, where_clause, order_by, limit)
            .to_string(MysqlQueryBuilder)
    }
}

// ===========================================================================
// SQL Server (manual SQL, no sea-query backend)
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@p{}", index)
    }

    fn list_tables_sql(&self, schema: Option<&str>) -> String {
        let schema = escape_string_literal(schema.unwrap_or("dbo"));
        format!(
            r#"SELECT
                s.name AS table_schema,
                t.name AS table_name,
                SUM(p.rows) AS estimated_rows
            FROM sys.tables t
            JOIN sys.schemas s ON s.schema_id = t.schema_id
            JOIN sys.partitions p ON p.object_id = t.object_id AND p.index_id IN (0, 1)
            WHERE s.name = '{}'
            GROUP BY s.name, t.name
            ORDER BY t.name"#,
            schema
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("dbo"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.COLUMN_NAME as column_name,
                c.DATA_TYPE as data_type,
                CASE c.IS_NULLABLE WHEN 'YES' THEN 1 ELSE 0 END as nullable,
                c.ORDINAL_POSITION as ordinal_position,
                k.ORDINAL_POSITION as pk_ordinal
            FROM INFORMATION_SCHEMA.COLUMNS c
            LEFT JOIN INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                ON tc.TABLE_SCHEMA = c.TABLE_SCHEMA
                AND tc.TABLE_NAME = c.TABLE_NAME
                AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
            LEFT JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
                ON k.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND k.TABLE_SCHEMA = c.TABLE_SCHEMA
                AND k.COLUMN_NAME = c.COLUMN_NAME
            WHERE c.TABLE_SCHEMA = '{}' AND c.TABLE_NAME = '{}'
            ORDER BY c.ORDINAL_POSITION"#,
            schema, table
        )
    }

    fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: &[(&str, bool)],
        limit: Option<u64>,
    ) -> String {
        let cols = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = match limit {
            Some(l) => format!("SELECT TOP ({}) {}", l, cols),
            None => format!("SELECT {}", cols),
        };
        sql.push_str(&format!(" FROM {}", self.qualified_table(schema, table)));

        if let Some(w) = where_clause {
            sql.push_str(&format!(" WHERE {}", w));
        }

        if !order_by.is_empty() {
            let order_parts: Vec<_> = order_by
                .iter()
                .map(|(col, asc)| {
                    format!(
                        "{} {}",
                        self.quote_identifier(col),
                        if *asc { "ASC" } else { "DESC" }
                    )
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", order_parts.join(", ")));
        }

        sql
    }
}

/// Get a dialect instance by database type name
pub fn dialect_for(name: &str) -> Box<dyn SqlDialect> {
    match name.to_lowercase().as_str() {
        "postgres" | "postgresql" => Box::new(PostgresDialect),
        "mysql" | "mariadb" => Box::new(MySqlDialect),
        "sqlserver" | "mssql" | "sql server" => Box::new(SqlServerDialect),
        _ => Box::new(PostgresDialect), // Default to PostgreSQL
    }
}
