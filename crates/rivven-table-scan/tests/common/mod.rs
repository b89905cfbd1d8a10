//! In-memory database shared by the integration tests.
//!
//! Understands the statements the scanner sends through the PostgreSQL
//! dialect: `FROM "schema"."table"`, an optional key predicate whose
//! parameters are the previous key, and `LIMIT n`. Rows come back sorted by
//! key, strictly after the bound key.

#![allow(dead_code)]

use async_trait::async_trait;
use regex::Regex;
use rivven_table_scan::key::{compare_values, KeyTuple};
use rivven_table_scan::prelude::*;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct MemTable {
    meta: TableMetadata,
    rows: Vec<Row>,
}

impl MemTable {
    fn key_names(&self) -> Vec<String> {
        self.meta
            .primary_key_columns()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    fn key_of(&self, row: &Row, names: &[String]) -> KeyTuple {
        KeyTuple::new(
            names
                .iter()
                .map(|n| row.get_by_name(n).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

/// In-memory tables keyed by qualified name
#[derive(Default)]
pub struct MemDb {
    tables: Mutex<BTreeMap<String, MemTable>>,
    foreign_keys: Mutex<Vec<ForeignKeyMetadata>>,
    // (queries to let through, queries to fail)
    failures: Mutex<(usize, usize)>,
    queries: AtomicUsize,
}

impl MemDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a table; rows are stored in the given (arbitrary) order
    pub fn create_table(&self, meta: TableMetadata) {
        self.tables.lock().unwrap().insert(
            meta.qualified_name(),
            MemTable {
                meta,
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, qualified_name: &str, values: Vec<Value>) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(qualified_name).expect("unknown table");
        let columns = table.meta.column_names().iter().map(|c| c.to_string()).collect();
        table.rows.push(Row::new(columns, values));
    }

    pub fn add_foreign_key(&self, fk: ForeignKeyMetadata) {
        self.foreign_keys.lock().unwrap().push(fk);
    }

    /// Fail the next `n` scan queries
    pub fn fail_next(&self, n: usize) {
        self.fail_after(0, n);
    }

    /// Let `skip` queries through, then fail `n`
    pub fn fail_after(&self, skip: usize, n: usize) {
        *self.failures.lock().unwrap() = (skip, n);
    }

    /// Scan queries served so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        {
            let mut failures = self.failures.lock().unwrap();
            match *failures {
                (_, 0) => {}
                (0, n) => {
                    failures.1 = n - 1;
                    return Err(Error::query_with_sql("injected failure", sql));
                }
                (skip, _) => failures.0 = skip - 1,
            }
        }
        self.queries.fetch_add(1, Ordering::SeqCst);

        let from = Regex::new(r#"FROM (?:"([^"]+)"\.)?"([^"]+)""#).unwrap();
        let caps = from
            .captures(sql)
            .ok_or_else(|| Error::query_with_sql("no FROM clause", sql))?;
        let name = match caps.get(1) {
            Some(schema) => format!("{}.{}", schema.as_str(), &caps[2]),
            None => caps[2].to_string(),
        };
        let limit = Regex::new(r"LIMIT (\d+)")
            .unwrap()
            .captures(sql)
            .map(|c| c[1].parse::<usize>().unwrap())
            .unwrap_or(usize::MAX);

        let disjuncts = parse_key_predicate(sql, params)?;

        let tables = self.tables.lock().unwrap();
        let table = tables
            .get(&name)
            .ok_or_else(|| Error::TableNotFound { table: name.clone() })?;
        let keys = table.key_names();

        let mut rows: Vec<(KeyTuple, Row)> = table
            .rows
            .iter()
            .filter(|r| disjuncts.is_empty() || disjuncts.iter().any(|d| d.matches(r)))
            .map(|r| (table.key_of(r, &keys), r.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.compare(&b.0).unwrap_or(CmpOrdering::Equal));
        Ok(rows.into_iter().take(limit).map(|(_, r)| r).collect())
    }
}

/// One `("k1" = $1 AND ... AND "kn" > $n)` term of the key predicate,
/// with its placeholders resolved
struct Disjunct(Vec<(String, bool, Value)>);

impl Disjunct {
    fn matches(&self, row: &Row) -> bool {
        self.0.iter().all(|(column, greater, bound)| {
            let expected = if *greater {
                CmpOrdering::Greater
            } else {
                CmpOrdering::Equal
            };
            row.get_by_name(column)
                .and_then(|v| compare_values(v, bound))
                .is_some_and(|ord| ord == expected)
        })
    }
}

/// Evaluate the WHERE text the scanner sent rather than trusting the
/// parameters: every placeholder must resolve and the parameters must line
/// up with the columns they are compared to.
fn parse_key_predicate(sql: &str, params: &[Value]) -> Result<Vec<Disjunct>> {
    let Some(caps) = Regex::new(r"WHERE (.*) ORDER BY").unwrap().captures(sql) else {
        if !params.is_empty() {
            return Err(Error::query_with_sql("parameters without a WHERE clause", sql));
        }
        return Ok(Vec::new());
    };
    let condition = caps[1].to_string();

    let disjunct = Regex::new(r#"\(((?:"[^"]+" = \$\d+ AND )*"[^"]+" > \$\d+)\)"#).unwrap();
    let term = Regex::new(r#""([^"]+)" (=|>) \$(\d+)"#).unwrap();
    let mut used = vec![false; params.len()];
    let mut disjuncts = Vec::new();
    for d in disjunct.captures_iter(&condition) {
        let mut terms = Vec::new();
        for t in term.captures_iter(&d[1]) {
            let idx: usize = t[3].parse().unwrap();
            let bound = params
                .get(idx - 1)
                .ok_or_else(|| Error::query_with_sql(format!("unbound placeholder ${}", idx), sql))?;
            used[idx - 1] = true;
            terms.push((t[1].to_string(), &t[2] == ">", bound.clone()));
        }
        disjuncts.push(Disjunct(terms));
    }

    if disjuncts.is_empty() || used.iter().any(|u| !u) {
        return Err(Error::query_with_sql("key predicate does not use its parameters", sql));
    }
    Ok(disjuncts)
}

pub struct MemConnection {
    db: Arc<MemDb>,
}

#[async_trait]
impl Connection for MemConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        tokio::task::yield_now().await;
        self.db.run(sql, params)
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemFactory(pub Arc<MemDb>);

#[async_trait]
impl ConnectionFactory for MemFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemConnection {
            db: Arc::clone(&self.0),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

#[async_trait]
impl SchemaProvider for MemDb {
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableMetadata>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .values()
            .filter(|t| schema.is_none() || t.meta.schema.as_deref() == schema)
            .map(|t| {
                let mut listed = TableMetadata::new(t.meta.name.clone())
                    .with_estimated_rows(t.rows.len() as u64);
                listed.schema = t.meta.schema.clone();
                listed
            })
            .collect())
    }

    async fn get_table(&self, schema: Option<&str>, table: &str) -> Result<Option<TableMetadata>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .values()
            .find(|t| t.meta.name == table && (schema.is_none() || t.meta.schema.as_deref() == schema))
            .map(|t| t.meta.clone()))
    }

    async fn list_foreign_keys(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyMetadata>> {
        Ok(self
            .foreign_keys
            .lock()
            .unwrap()
            .iter()
            .filter(|fk| fk.source_table == table && fk.source_schema.as_deref() == schema)
            .cloned()
            .collect())
    }
}

pub async fn pool(db: &Arc<MemDb>) -> Arc<dyn ConnectionPool> {
    SimpleConnectionPool::new(
        PoolConfig::new("postgres://scan@localhost/test").with_max_size(2),
        Arc::new(MemFactory(Arc::clone(db))),
    )
    .await
    .unwrap()
}

/// Source over the tables matched by `configs`
pub async fn source(
    db: &Arc<MemDb>,
    configs: &[TableConfig],
    order: TableOrderStrategy,
    strategy: BatchTableStrategy,
) -> TableScanSource {
    let registry = TableRegistry::resolve(db.as_ref(), configs, order)
        .await
        .unwrap();
    TableScanSource::new(registry, pool(db).await, Box::new(PostgresDialect), strategy)
}

/// `public.<name>` with key `(a, b)` and a text payload
pub fn composite_table(db: &MemDb, name: &str) {
    db.create_table(
        TableMetadata::new(name)
            .with_schema("public")
            .with_column(ColumnMetadata::new("a", "integer").primary_key(1))
            .with_column(ColumnMetadata::new("b", "integer").primary_key(2))
            .with_column(ColumnMetadata::new("payload", "text")),
    );
}

/// Insert `n` rows with keys `(i / 5, i % 5)`, highest key first
pub fn fill_composite(db: &MemDb, name: &str, n: i32) {
    let qualified = format!("public.{}", name);
    for i in (0..n).rev() {
        db.insert(
            &qualified,
            vec![
                Value::Int32(i / 5),
                Value::Int32(i % 5),
                Value::String(format!("{}-{}", name, i)),
            ],
        );
    }
}

/// `public.<name>` with a single integer key `id`
pub fn simple_table(db: &MemDb, name: &str, n: i32) {
    db.create_table(
        TableMetadata::new(name)
            .with_schema("public")
            .with_column(ColumnMetadata::new("id", "integer").primary_key(1))
            .with_column(ColumnMetadata::new("payload", "text")),
    );
    for i in 1..=n {
        db.insert(
            &format!("public.{}", name),
            vec![Value::Int32(i), Value::String(format!("{}-{}", name, i))],
        );
    }
}

/// `(a, b)` of a composite-key record
pub fn ab(record: &Record) -> (i64, i64) {
    (
        record.get("a").and_then(Value::as_i64).unwrap(),
        record.get("b").and_then(Value::as_i64).unwrap(),
    )
}
