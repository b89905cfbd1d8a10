//! Connection pool for rivven-table-scan
//!
//! The scan engine acquires exactly one connection per query and releases it
//! when the guard drops, on success and on every error path.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_table_scan::prelude::*;
//! use rivven_table_scan::postgres::PgConnectionFactory;
//!
//! let pool = SimpleConnectionPool::new(
//!     PoolConfig::new("postgres://localhost/db").with_max_size(4),
//!     Arc::new(PgConnectionFactory),
//! ).await?;
//!
//! let conn = pool.get().await?;
//! conn.query("SELECT 1", &[]).await?;
//! // Connection is returned to pool when dropped
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::connection::{redact_url, Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Get a connection from the pool
    async fn get(&self) -> Result<PooledConnection>;

    /// Return a connection to the pool
    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant);

    /// Get current pool size
    fn size(&self) -> usize;

    /// Get pool statistics
    fn stats(&self) -> PoolStats;

    /// Close all connections and shutdown the pool
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    pool: Arc<dyn ConnectionPool>,
}

impl PooledConnection {
    /// Create a new pooled connection wrapper
    pub fn new(
        conn: Box<dyn Connection>,
        created_at: Instant,
        pool: Arc<dyn ConnectionPool>,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            pool,
        }
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &(dyn Connection + 'static) {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .as_ref()
    }

    /// Age of the underlying physical connection
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let created_at = self.created_at;
            tokio::spawn(async move {
                pool.return_connection(conn, created_at).await;
            });
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Minimum pool size (idle connections)
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 1,
            max_size: 4,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(600),  // 10 minutes
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Total number of connections handed back
    pub releases: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub releases: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a release back to the pool
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// Semaphore-bounded connection pool.
///
/// Idle connections are kept in a LIFO stack; expired or unhealthy ones are
/// closed on borrow. A permit is held for every connection that is out of the
/// pool and given back when its guard is returned.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    semaphore: Semaphore,
    total_connections: AtomicUsize,
    stats: Arc<AtomicPoolStats>,
    shutdown: AtomicBool,
    self_ref: OnceCell<Weak<Self>>,
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

impl SimpleConnectionPool {
    /// Create a new connection pool.
    ///
    /// Initializes with `min_size` connections eagerly; warm-up failures are
    /// logged and left to the first borrow.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        let pool = Arc::new(Self {
            semaphore: Semaphore::new(config.max_size),
            config: config.clone(),
            factory,
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            total_connections: AtomicUsize::new(0),
            stats: Arc::new(AtomicPoolStats::default()),
            shutdown: AtomicBool::new(false),
            self_ref: OnceCell::new(),
        });

        let _ = pool.self_ref.set(Arc::downgrade(&pool));

        for _ in 0..config.min_size.min(config.max_size) {
            match pool.create_connection().await {
                Ok(conn) => {
                    let now = Instant::now();
                    pool.idle.lock().await.push(PoolEntry {
                        conn,
                        created_at: now,
                        last_used: now,
                    });
                }
                Err(e) => {
                    warn!(
                        url = %redact_url(&config.connection.url),
                        error = %e,
                        "Pool warm-up connection failed"
                    );
                    break;
                }
            }
        }

        Ok(pool)
    }

    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats.record_created();
        Ok(conn)
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    fn discard(&self) {
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "Pool is shut down".to_string(),
            });
        }

        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                self.stats.record_exhausted();
                Error::PoolExhausted {
                    message: format!(
                        "Timeout waiting for connection ({}ms)",
                        self.config.acquire_timeout.as_millis()
                    ),
                }
            })?
            .map_err(|_| Error::PoolExhausted {
                message: "Pool semaphore closed".to_string(),
            })?;

        let reused = {
            let mut idle = self.idle.lock().await;
            loop {
                match idle.pop() {
                    Some(entry) => {
                        if self.should_recycle(&entry) {
                            let _ = entry.conn.close().await;
                            self.discard();
                            continue;
                        }
                        if self.config.test_on_borrow && !entry.conn.is_valid().await {
                            self.discard();
                            self.stats.record_health_check_failure();
                            continue;
                        }
                        break Some((entry.conn, entry.created_at));
                    }
                    None => break None,
                }
            }
        };

        // The permit is dropped (released) if connecting fails.
        let (conn, created_at) = match reused {
            Some(found) => found,
            None => (self.create_connection().await?, Instant::now()),
        };

        let pool_arc = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::PoolExhausted {
                message: "Pool has been dropped".to_string(),
            })?;

        self.stats.record_acquisition();
        // Released again in return_connection.
        permit.forget();

        Ok(PooledConnection::new(conn, created_at, pool_arc))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        self.semaphore.add_permits(1);
        self.stats.record_release();

        if self.shutdown.load(Ordering::Acquire) {
            let _ = conn.close().await;
            self.discard();
            return;
        }

        debug!(age_ms = created_at.elapsed().as_millis() as u64, "Connection returned to pool");
        self.idle.lock().await.push(PoolEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        });
    }

    fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            let _ = entry.conn.close().await;
            self.discard();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseType;
    use crate::types::{Row, Value};

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(vec![])
        }

        async fn is_valid(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        fail: bool,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
            if self.fail {
                return Err(Error::connection("refused"));
            }
            Ok(Box::new(NullConnection))
        }

        fn database_type(&self) -> DatabaseType {
            DatabaseType::Unknown
        }
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("postgres://localhost/test")
            .with_min_size(2)
            .with_max_size(8)
            .with_acquire_timeout(Duration::from_secs(10))
            .with_test_on_borrow(false);

        assert_eq!(config.min_size, 2);
        assert_eq!(config.max_size, 8);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
        assert!(!config.test_on_borrow);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::default();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition();
        stats.record_release();
        stats.record_closed();
        stats.record_exhausted();
        stats.record_health_check_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.acquisitions, 1);
        assert_eq!(snapshot.releases, 1);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.health_check_failures, 1);
    }

    #[tokio::test]
    async fn test_connection_returned_on_drop() {
        let pool = SimpleConnectionPool::new(
            PoolConfig::new("mem://").with_min_size(0).with_max_size(1),
            Arc::new(CountingFactory::default()),
        )
        .await
        .unwrap();

        for _ in 0..3 {
            let conn = pool.get().await.unwrap();
            conn.query("SELECT 1", &[]).await.unwrap();
            drop(conn);
            tokio::task::yield_now().await;
        }

        let stats = pool.stats();
        assert_eq!(stats.acquisitions, 3);
        assert_eq!(stats.connections_created, 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_guard_exposes_connection() {
        let pool = SimpleConnectionPool::new(
            PoolConfig::new("mem://").with_min_size(0).with_max_size(1),
            Arc::new(CountingFactory::default()),
        )
        .await
        .unwrap();

        let guard = pool.get().await.unwrap();
        let by_deref: &dyn Connection = &*guard;
        assert!(by_deref.is_valid().await);
        assert!(guard.connection().query("SELECT 1", &[]).await.unwrap().is_empty());
        assert!(guard.age() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_failed_connect_releases_permit() {
        let pool = SimpleConnectionPool::new(
            PoolConfig::new("mem://")
                .with_min_size(0)
                .with_max_size(1)
                .with_acquire_timeout(Duration::from_millis(50)),
            Arc::new(CountingFactory { fail: true }),
        )
        .await
        .unwrap();

        for _ in 0..2 {
            let err = pool.get().await.err().unwrap();
            assert!(matches!(err, Error::Connection { .. }));
        }
        assert_eq!(pool.stats().exhausted_count, 0);
    }

    #[tokio::test]
    async fn test_zero_max_size_rejected() {
        let result = SimpleConnectionPool::new(
            PoolConfig::new("mem://").with_max_size(0),
            Arc::new(CountingFactory::default()),
        )
        .await;
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
