//! Table scanner: one table's read cursor.
//!
//! Each [`TableScanner::read_batch`] runs one bounded query strictly after the
//! stored key, materializes every row, and only then moves the stored key to
//! the last row. Any failure leaves the cursor where it was, so the same call
//! can simply be retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, warn};

use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::key::KeyTuple;
use crate::pool::ConnectionPool;
use crate::predicate::PredicateBuilder;
use crate::record::Record;
use crate::table::TableContext;

/// Lifecycle of a table cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    /// No query issued yet in this run
    #[default]
    NotStarted,
    /// Last query returned rows
    Scanning,
    /// Last query returned nothing; polled again later
    Idle,
    /// Treated as finished (finite-table mode only)
    Exhausted,
}

/// Rows read by one scanner call
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    /// Records in key order
    pub records: Vec<Record>,
    /// Stored key after the call
    pub offset: Option<KeyTuple>,
}

impl ScanBatch {
    /// Check if batch has records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get record count
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Scan statistics
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    /// Scan queries that succeeded
    pub queries: u64,
    /// Records materialized
    pub records: u64,
    /// Queries that returned no rows
    pub empty_polls: u64,
    /// Queries or materializations that failed
    pub query_errors: u64,
    /// Total query time (milliseconds)
    pub total_query_time_ms: u64,
    /// Average records per successful query
    pub avg_records_per_query: f64,
}

/// Atomic scan statistics shared by all scanners of a source
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicScanStats {
    pub queries: AtomicU64,
    pub records: AtomicU64,
    pub empty_polls: AtomicU64,
    pub query_errors: AtomicU64,
    pub total_query_time_ms: AtomicU64,
}

impl AtomicScanStats {
    /// Record a successful query
    pub fn record_query(&self, records: u64, duration_ms: u64) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(records, Ordering::Relaxed);
        self.total_query_time_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        if records == 0 {
            self.empty_polls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a failed query
    pub fn record_error(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> ScanStats {
        let records = self.records.load(Ordering::Relaxed);
        let queries = self.queries.load(Ordering::Relaxed);
        let avg = if queries > 0 {
            records as f64 / queries as f64
        } else {
            0.0
        };

        ScanStats {
            queries,
            records,
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            total_query_time_ms: self.total_query_time_ms.load(Ordering::Relaxed),
            avg_records_per_query: avg,
        }
    }
}

/// Read cursor over one table
#[derive(Debug, Clone)]
pub struct TableScanner {
    table: TableContext,
    offset: Option<KeyTuple>,
    state: ScanState,
}

impl TableScanner {
    /// Create a scanner positioned at the table's configured start
    pub fn new(table: TableContext) -> Self {
        let offset = table.initial_offset().cloned();
        Self {
            table,
            offset,
            state: ScanState::NotStarted,
        }
    }

    /// Table description
    pub fn table(&self) -> &TableContext {
        &self.table
    }

    /// Key of the last delivered row, `None` before the first row
    pub fn offset(&self) -> Option<&KeyTuple> {
        self.offset.as_ref()
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Whether the table is finished (finite-table mode)
    pub fn is_exhausted(&self) -> bool {
        self.state == ScanState::Exhausted
    }

    /// Reposition the cursor from a decoded offset token.
    ///
    /// `None` falls back to the configured initial offset.
    pub fn seek(&mut self, offset: Option<KeyTuple>, exhausted: bool) {
        self.offset = offset.or_else(|| self.table.initial_offset().cloned());
        self.state = if exhausted {
            ScanState::Exhausted
        } else {
            ScanState::NotStarted
        };
    }

    /// Mark the table finished
    pub fn mark_exhausted(&mut self) {
        self.state = ScanState::Exhausted;
    }

    /// Read up to `max_rows` rows after the stored key.
    ///
    /// One pooled connection is held for the query only. The stored key
    /// moves to the last returned row, or stays put when nothing came back
    /// or anything failed.
    pub async fn read_batch(
        &mut self,
        pool: &dyn ConnectionPool,
        dialect: &dyn SqlDialect,
        max_rows: usize,
        stats: &AtomicScanStats,
    ) -> Result<ScanBatch> {
        if max_rows == 0 {
            return Ok(ScanBatch {
                records: Vec::new(),
                offset: self.offset.clone(),
            });
        }

        let table_name = self.table.qualified_name();
        let query = PredicateBuilder::new(dialect).build_query(
            &self.table,
            self.offset.as_ref(),
            max_rows as u64,
        )?;
        debug!(table = %table_name, sql = %query.sql, params = query.params.len(), "Scan query");

        let start = Instant::now();
        let rows = {
            let conn = pool.get().await.inspect_err(|_| stats.record_error())?;
            conn.query(&query.sql, &query.params)
                .await
                .inspect_err(|e| {
                    stats.record_error();
                    warn!(table = %table_name, error = %e, "Scan query failed");
                })?
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if rows.len() > max_rows {
            warn!(
                table = %table_name,
                rows = rows.len(),
                limit = max_rows,
                "Query returned more rows than requested; extra rows are left for the next read"
            );
        }

        let mut records = Vec::with_capacity(rows.len().min(max_rows));
        let mut last_key = None;
        for row in rows.iter().take(max_rows) {
            let key = KeyTuple::from_row(row, self.table.key_columns())
                .and_then(|key| Record::from_row(&self.table, row).map(|rec| (key, rec)));
            match key {
                Ok((key, record)) => {
                    records.push(record);
                    last_key = Some(key);
                }
                Err(e) => {
                    stats.record_error();
                    warn!(table = %table_name, error = %e, "Discarding partial batch");
                    return Err(e);
                }
            }
        }

        stats.record_query(records.len() as u64, elapsed_ms);

        match last_key {
            Some(key) => {
                if let (Some(prev), Some(first)) = (self.offset.as_ref(), records.first()) {
                    self.check_progress(prev, first, &key);
                }
                debug!(table = %table_name, rows = records.len(), offset = %key, "Scan batch read");
                self.offset = Some(key);
                self.state = ScanState::Scanning;
            }
            None => {
                debug!(table = %table_name, "No new rows");
                self.state = ScanState::Idle;
            }
        }

        Ok(ScanBatch {
            records,
            offset: self.offset.clone(),
        })
    }

    // Collations can disagree with code point order, so this only warns.
    fn check_progress(&self, prev: &KeyTuple, first: &Record, last: &KeyTuple) {
        let first_key: Vec<_> = self
            .table
            .key_columns()
            .iter()
            .filter_map(|c| first.get(&c.name).cloned())
            .collect();
        let first_key = KeyTuple::new(first_key);

        for key in [&first_key, last] {
            if let Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal) = key.compare(prev) {
                warn!(
                    table = %self.table.qualified_name(),
                    previous = %prev,
                    returned = %key,
                    "Offset did not advance past previous key"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_scan_stats() {
        let stats = AtomicScanStats::default();
        stats.record_query(10, 5);
        stats.record_query(0, 1);
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queries, 2);
        assert_eq!(snapshot.records, 10);
        assert_eq!(snapshot.empty_polls, 1);
        assert_eq!(snapshot.query_errors, 1);
        assert_eq!(snapshot.total_query_time_ms, 6);
        assert!((snapshot.avg_records_per_query - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scan_batch_len() {
        let batch = ScanBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(ScanState::default(), ScanState::NotStarted);
    }
}
