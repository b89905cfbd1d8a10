//! Batch coordinator: spreads one `produce` call over the registered tables.
//!
//! Every call takes the last returned offset token and returns the next
//! batch plus a new token. When the token is the one this source returned
//! last, the in-memory cursors are reused; otherwise they are rebuilt from
//! the token alone, so a restarted process (or a retry after an error)
//! resumes exactly where the token says.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_table_scan::prelude::*;
//!
//! let registry = TableRegistry::resolve(&schema, &[TableConfig::new("%")], TableOrderStrategy::None).await?;
//! let mut source = TableScanSource::new(registry, pool, Box::new(PostgresDialect), BatchTableStrategy::SwitchTables);
//!
//! let mut offset = String::new();
//! loop {
//!     let batch = source.produce(&offset, 500).await?;
//!     deliver(batch.records).await?;
//!     offset = batch.offset;
//! }
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TableScanConfig;
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::key::KeyTuple;
use crate::offset::{OffsetToken, TableOffset};
use crate::pool::ConnectionPool;
use crate::record::Record;
use crate::registry::TableRegistry;
use crate::scanner::{AtomicScanStats, ScanStats, TableScanner};
use crate::schema::SchemaProvider;

/// How one batch is spread over tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchTableStrategy {
    /// Move to the next table after each table's contribution
    #[default]
    SwitchTables,
    /// Stay on a table until it yields nothing, then move on
    ProcessAllAvailableRowsFromTable,
}

impl BatchTableStrategy {
    /// Pick the table to visit after `current`.
    ///
    /// Exhausted tables are skipped; `None` once every table is exhausted.
    pub fn select_next(
        self,
        scanners: &[TableScanner],
        current: usize,
        current_had_rows: bool,
    ) -> Option<usize> {
        let stay = match self {
            Self::SwitchTables => false,
            Self::ProcessAllAvailableRowsFromTable => current_had_rows,
        };
        if stay && scanners.get(current).is_some_and(|s| !s.is_exhausted()) {
            return Some(current);
        }
        first_active(scanners, current + 1)
    }
}

// First non-exhausted scanner at or after `from`, wrapping around.
fn first_active(scanners: &[TableScanner], from: usize) -> Option<usize> {
    let n = scanners.len();
    (0..n)
        .map(|i| (from + i) % n)
        .find(|&i| !scanners[i].is_exhausted())
}

/// Records of one `produce` call and the offset after them
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Records in delivery order; key order within each table
    pub records: Vec<Record>,
    /// Token to pass to the next `produce` call
    pub offset: String,
}

impl Batch {
    /// Check if batch has records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get record count
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Incremental multi-table source
pub struct TableScanSource {
    pool: Arc<dyn ConnectionPool>,
    dialect: Box<dyn SqlDialect>,
    scanners: Vec<TableScanner>,
    strategy: BatchTableStrategy,
    finite_tables: bool,
    batch_limit: Option<usize>,
    cursor: usize,
    carried: BTreeMap<String, TableOffset>,
    last_token: Option<String>,
    stats: Arc<AtomicScanStats>,
}

impl TableScanSource {
    /// Create a source over the registry's tables, in registry order
    pub fn new(
        registry: TableRegistry,
        pool: Arc<dyn ConnectionPool>,
        dialect: Box<dyn SqlDialect>,
        strategy: BatchTableStrategy,
    ) -> Self {
        info!(
            tables = registry.len(),
            dialect = dialect.name(),
            strategy = ?strategy,
            "Table scan source created"
        );
        Self {
            pool,
            dialect,
            scanners: registry.into_tables().into_iter().map(TableScanner::new).collect(),
            strategy,
            finite_tables: false,
            batch_limit: None,
            cursor: 0,
            carried: BTreeMap::new(),
            last_token: None,
            stats: Arc::new(AtomicScanStats::default()),
        }
    }

    /// Resolve the configured tables and build a source
    pub async fn from_config(
        config: &TableScanConfig,
        pool: Arc<dyn ConnectionPool>,
        dialect: Box<dyn SqlDialect>,
        schema: &dyn SchemaProvider,
    ) -> Result<Self> {
        config.check()?;
        let registry =
            TableRegistry::resolve(schema, &config.tables, config.table_order_strategy).await?;
        Ok(Self::new(registry, pool, dialect, config.batch_strategy)
            .with_finite_tables(config.finite_tables)
            .with_batch_limit(config.max_batch_size))
    }

    /// Treat tables as finished after their first empty read
    pub fn with_finite_tables(mut self, finite: bool) -> Self {
        self.finite_tables = finite;
        self
    }

    /// Cap every batch at `limit` records regardless of the requested size
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    /// Table cursors in visitation order
    pub fn scanners(&self) -> &[TableScanner] {
        &self.scanners
    }

    /// Whether every table is exhausted (finite-table mode)
    pub fn is_finished(&self) -> bool {
        !self.scanners.is_empty() && self.scanners.iter().all(TableScanner::is_exhausted)
    }

    /// Get scan statistics
    pub fn stats(&self) -> ScanStats {
        self.stats.snapshot()
    }

    /// Read the next batch after `offset`.
    ///
    /// Returns at most `max_batch_size` records. With nothing to return (or
    /// `max_batch_size == 0`) the input token comes back unchanged, unless
    /// finite-table mode just exhausted a table: the returned token then
    /// records it. On error nothing is committed: retrying with the same
    /// token is safe.
    pub async fn produce(&mut self, offset: &str, max_batch_size: usize) -> Result<Batch> {
        self.restore(offset)?;

        let max = self
            .batch_limit
            .map_or(max_batch_size, |limit| max_batch_size.min(limit));
        if max == 0 {
            return Ok(Batch {
                records: Vec::new(),
                offset: offset.to_string(),
            });
        }

        let exhausted_before = self.exhausted_count();
        match self.fill(max).await {
            Ok(records) if records.is_empty() && self.exhausted_count() == exhausted_before => {
                Ok(Batch {
                    records,
                    offset: offset.to_string(),
                })
            }
            Ok(records) => {
                let token = self.snapshot()?;
                debug!(records = records.len(), "Produced batch");
                self.last_token = Some(token.clone());
                Ok(Batch {
                    records,
                    offset: token,
                })
            }
            Err(e) => {
                // in-memory cursors may have moved; rebuild from the token next time
                self.last_token = None;
                Err(e)
            }
        }
    }

    fn exhausted_count(&self) -> usize {
        self.scanners.iter().filter(|s| s.is_exhausted()).count()
    }

    async fn fill(&mut self, max: usize) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let Some(mut idx) = first_active(&self.scanners, self.cursor) else {
            debug!("All tables exhausted");
            return Ok(records);
        };
        let mut empty_streak = 0usize;

        loop {
            let remaining = max - records.len();
            let scanner = &mut self.scanners[idx];
            let batch = scanner
                .read_batch(
                    self.pool.as_ref(),
                    self.dialect.as_ref(),
                    remaining,
                    &self.stats,
                )
                .await?;

            let had_rows = !batch.is_empty();
            records.extend(batch.records);
            if had_rows {
                empty_streak = 0;
            } else if self.finite_tables {
                info!(table = %scanner.table().qualified_name(), "Table exhausted");
                scanner.mark_exhausted();
            } else {
                empty_streak += 1;
            }

            let next = self.strategy.select_next(&self.scanners, idx, had_rows);
            self.cursor = next.unwrap_or(0);

            let Some(next) = next else { break };
            if records.len() >= max {
                break;
            }
            if had_rows && self.strategy == BatchTableStrategy::ProcessAllAvailableRowsFromTable {
                break;
            }
            let active = self.scanners.iter().filter(|s| !s.is_exhausted()).count();
            if empty_streak >= active {
                break;
            }
            idx = next;
        }

        Ok(records)
    }

    fn restore(&mut self, offset: &str) -> Result<()> {
        if self.last_token.as_deref() == Some(offset) {
            return Ok(());
        }

        let token = OffsetToken::parse(offset)?;

        let mut positions: Vec<(Option<KeyTuple>, bool)> = Vec::with_capacity(self.scanners.len());
        for scanner in &self.scanners {
            let table = scanner.table();
            positions.push((
                token.key_for(table)?,
                token.is_exhausted(&table.qualified_name()),
            ));
        }

        let mut carried = BTreeMap::new();
        for (name, entry) in &token.tables {
            if !self.scanners.iter().any(|s| &s.table().qualified_name() == name) {
                warn!(table = %name, "Offset for unregistered table carried forward");
                carried.insert(name.clone(), entry.clone());
            }
        }

        let cursor = match &token.next {
            Some(next) => match self
                .scanners
                .iter()
                .position(|s| &s.table().qualified_name() == next)
            {
                Some(pos) => pos,
                None => {
                    warn!(table = %next, "Offset names an unregistered next table");
                    0
                }
            },
            None => 0,
        };

        for (scanner, (key, exhausted)) in self.scanners.iter_mut().zip(positions) {
            scanner.seek(key, exhausted);
        }
        self.carried = carried;
        self.cursor = cursor;
        self.last_token = Some(offset.to_string());

        debug!(
            tables = self.scanners.len(),
            carried = self.carried.len(),
            start = !offset.is_empty(),
            "Restored cursors from offset"
        );
        Ok(())
    }

    fn snapshot(&self) -> Result<String> {
        let mut token = OffsetToken {
            tables: self.carried.clone(),
            ..Default::default()
        };
        for scanner in &self.scanners {
            token.set_table(scanner.table(), scanner.offset(), scanner.is_exhausted())?;
        }
        token.next = first_active(&self.scanners, self.cursor)
            .map(|i| self.scanners[i].table().qualified_name());
        token.encode()
    }
}

impl std::fmt::Debug for TableScanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableScanSource")
            .field("dialect", &self.dialect.name())
            .field("tables", &self.scanners.len())
            .field("strategy", &self.strategy)
            .field("finite_tables", &self.finite_tables)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableContext;
    use crate::types::{ColumnMetadata, TableMetadata};

    fn scanners(names: &[&str]) -> Vec<TableScanner> {
        names
            .iter()
            .map(|n| {
                let meta = TableMetadata::new(*n)
                    .with_column(ColumnMetadata::new("id", "integer").primary_key(1));
                TableScanner::new(TableContext::from_metadata(&meta, None).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_switch_tables_round_robin() {
        let s = scanners(&["a", "b", "c"]);
        let strategy = BatchTableStrategy::SwitchTables;
        assert_eq!(strategy.select_next(&s, 0, true), Some(1));
        assert_eq!(strategy.select_next(&s, 1, false), Some(2));
        assert_eq!(strategy.select_next(&s, 2, true), Some(0));
    }

    #[test]
    fn test_process_all_stays_until_empty() {
        let s = scanners(&["a", "b"]);
        let strategy = BatchTableStrategy::ProcessAllAvailableRowsFromTable;
        assert_eq!(strategy.select_next(&s, 0, true), Some(0));
        assert_eq!(strategy.select_next(&s, 0, false), Some(1));
        assert_eq!(strategy.select_next(&s, 1, false), Some(0));
    }

    #[test]
    fn test_select_skips_exhausted() {
        let mut s = scanners(&["a", "b", "c"]);
        s[1].mark_exhausted();
        assert_eq!(
            BatchTableStrategy::SwitchTables.select_next(&s, 0, true),
            Some(2)
        );

        s[0].mark_exhausted();
        assert_eq!(
            BatchTableStrategy::ProcessAllAvailableRowsFromTable.select_next(&s, 0, true),
            Some(2)
        );

        s[2].mark_exhausted();
        assert_eq!(BatchTableStrategy::SwitchTables.select_next(&s, 2, false), None);
    }

    #[test]
    fn test_strategy_serde() {
        let s: BatchTableStrategy =
            serde_json::from_str("\"process_all_available_rows_from_table\"").unwrap();
        assert_eq!(s, BatchTableStrategy::ProcessAllAvailableRowsFromTable);
        assert_eq!(BatchTableStrategy::default(), BatchTableStrategy::SwitchTables);
    }
}
