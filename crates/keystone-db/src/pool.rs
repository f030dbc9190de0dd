//! # Database Pool Management
//!
//! Connection pool creation, configuration, and statistics for SQLite.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Connection Pool                           │
//! │                                                                         │
//! │  Settings::db_config() / DbConfig::new(path)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← Create pool, install lifetime hooks     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────┐                           │
//! │  │            SqlitePool                    │                           │
//! │  │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐       │                           │
//! │  │  │Conn1│ │Conn2│ │Conn3│ │Conn4│ ...   │  (max_connections)        │
//! │  │  └─────┘ └─────┘ └─────┘ └─────┘       │                           │
//! │  └─────────────────────────────────────────┘                           │
//! │       │                                                                 │
//! │       │  before_acquire: close if idle longer than max_idle_time       │
//! │       │  after_release:  close if older than max_lifetime,             │
//! │       │                  else reset query_only                         │
//! │       ▼                                                                 │
//! │  Repository call ──► pooled connection (auto-commit)                   │
//! │  Transaction     ──► one connection pinned until commit/rollback       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled so readers don't block
//! the single writer and the writer doesn't block readers.

use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::{DbError, DbResult, TxStage};
use crate::health::HealthChecker;
use crate::repository::user::UserRepository;
use crate::txn::{TransactionManager, TxOptions};

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/keystone/app.db")
///     .max_connections(10)
///     .max_lifetime(Some(Duration::from_secs(600)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of open connections.
    /// Default: 25
    pub max_connections: u32,

    /// Connections kept open while idle.
    /// Default: 5
    pub min_connections: u32,

    /// How long to wait for a connection.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Connections older than this are closed on release.
    /// Default: 5 minutes
    pub max_lifetime: Option<Duration>,

    /// Connections idle longer than this are closed on acquire.
    /// Default: 5 minutes
    pub max_idle_time: Option<Duration>,
}

impl DbConfig {
    /// Creates a new database configuration with the given path.
    ///
    /// ## Arguments
    /// * `path` - Path to the SQLite database file. Created if missing.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 25,
            min_connections: 5,
            connect_timeout: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(300)),
            max_idle_time: Some(Duration::from_secs(300)),
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the maximum connection lifetime (`None` disables it).
    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Sets the maximum idle time (`None` disables it).
    pub fn max_idle_time(mut self, idle: Option<Duration>) -> Self {
        self.max_idle_time = idle;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// A SQLite in-memory database lives inside one connection, so the
    /// pool is pinned to a single connection that never expires.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            max_lifetime: None,
            max_idle_time: None,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Invalid(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Connect options shared by the pool and the migration runner.
    pub(crate) fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let connect_url = format!("sqlite://{}?mode=rwc", self.database_path.display());

        let options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::connection(format!("invalid database path: {e}"), Some(e)))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // SQLite ships with foreign keys disabled
            .foreign_keys(true)
            .busy_timeout(self.connect_timeout)
            .create_if_missing(true);

        Ok(options)
    }
}

// =============================================================================
// Pool Statistics
// =============================================================================

#[derive(Debug, Default)]
struct PoolCounters {
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    max_idle_time_closed: AtomicU64,
    max_lifetime_closed: AtomicU64,
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_open_connections: u32,
    pub open_connections: u32,
    pub in_use: u32,
    pub idle: u32,
    /// Acquisitions that found no idle connection with the pool at capacity.
    pub wait_count: u64,
    /// Total time spent in those acquisitions, in milliseconds.
    pub wait_duration_ms: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle providing repository access.
///
/// Cloning is cheap; every clone shares the same pool and counters.
///
/// ## Usage
/// ```rust,ignore
/// let db = Database::new(DbConfig::new("./keystone.db")).await?;
/// let scope = Scope::new();
///
/// let user = db.users().get_by_id(&scope, &id).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    /// The SQLite connection pool.
    pool: SqlitePool,
    config: Arc<DbConfig>,
    counters: Arc<PoolCounters>,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite: WAL, NORMAL synchronous, foreign keys on
    /// 3. Installs the idle-time and lifetime hooks
    /// 4. Opens the pool and verifies one round trip
    ///
    /// ## Returns
    /// * `Ok(Database)` - Ready-to-use database handle
    /// * `Err(DbError)` - Invalid config or the database is unreachable
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        config.validate()?;

        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        let connect_options = config.connect_options()?;
        debug!("Connection options configured");

        let counters = Arc::new(PoolCounters::default());
        let idle_limit = config.max_idle_time;
        let lifetime_limit = config.max_lifetime;
        let idle_counters = Arc::clone(&counters);
        let lifetime_counters = Arc::clone(&counters);

        // Expiry runs through hooks (not sqlx's own reaper) so closures are counted.
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(None)
            .max_lifetime(None)
            .before_acquire(move |_conn, meta| {
                let counters = Arc::clone(&idle_counters);
                Box::pin(async move {
                    match idle_limit {
                        Some(limit) if meta.idle_for > limit => {
                            counters.max_idle_time_closed.fetch_add(1, Ordering::Relaxed);
                            Ok(false)
                        }
                        _ => Ok(true),
                    }
                })
            })
            .after_release(move |conn, meta| {
                let counters = Arc::clone(&lifetime_counters);
                Box::pin(async move {
                    if let Some(limit) = lifetime_limit.filter(|limit| meta.age > *limit) {
                        debug!(age = ?meta.age, ?limit, "Closing connection past max lifetime");
                        counters.max_lifetime_closed.fetch_add(1, Ordering::Relaxed);
                        return Ok(false);
                    }

                    // Undo a read-only transaction's query_only, including
                    // one dropped without commit or rollback.
                    if let Err(e) = sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await {
                        warn!(error = %e, "Could not reset query_only; closing connection");
                        return Ok(false);
                    }
                    Ok(true)
                })
            })
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::connection("failed to open database pool", Some(e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| DbError::connection("failed to ping database", Some(e)))?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database pool created"
        );

        Ok(Database {
            pool,
            config: Arc::new(config),
            counters,
        })
    }

    /// Returns a reference to the connection pool.
    ///
    /// Prefer repository methods; raw pool access bypasses the ambient
    /// transaction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The configuration the pool was built from.
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Acquires a pooled connection, recording contention.
    pub(crate) async fn acquire(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        let contended = self.pool.num_idle() == 0 && self.pool.size() >= self.config.max_connections;
        let started = Instant::now();

        let conn = self.pool.acquire().await?;

        if contended {
            let waited = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
            self.counters.wait_nanos.fetch_add(waited, Ordering::Relaxed);
        }
        Ok(conn)
    }

    /// Begins a transaction with the statement the options call for.
    ///
    /// A read-only transaction also switches its connection to
    /// `query_only`; `after_release` switches it back.
    pub(crate) async fn begin(&self, options: TxOptions) -> DbResult<Transaction<'static, Sqlite>> {
        let begin_failed = |source| DbError::Transaction {
            stage: TxStage::Begin,
            source,
        };

        let mut tx = self
            .pool
            .begin_with(options.begin_statement())
            .await
            .map_err(begin_failed)?;

        if options.read_only {
            sqlx::query("PRAGMA query_only = ON")
                .execute(&mut *tx)
                .await
                .map_err(begin_failed)?;
        }
        Ok(tx)
    }

    /// Runs `SELECT 1`, bounded by `timeout`.
    ///
    /// ## Returns
    /// * `Ok(())` - Database answered in time
    /// * `Err(DbError::Timeout)` - No answer within `timeout`
    /// * `Err(DbError::ConnectionFailed)` - The query failed
    pub async fn health_check(&self, timeout: Duration) -> DbResult<()> {
        match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DbError::connection("health check query failed", Some(e))),
            Err(_) => Err(DbError::Timeout(timeout)),
        }
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> PoolStats {
        let open = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(open);

        PoolStats {
            max_open_connections: self.config.max_connections,
            open_connections: open,
            in_use: open - idle,
            idle,
            wait_count: self.counters.wait_count.load(Ordering::Relaxed),
            wait_duration_ms: self.counters.wait_nanos.load(Ordering::Relaxed) / 1_000_000,
            max_idle_time_closed: self.counters.max_idle_time_closed.load(Ordering::Relaxed),
            max_lifetime_closed: self.counters.max_lifetime_closed.load(Ordering::Relaxed),
        }
    }

    /// Whether [`Database::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Returns the user repository.
    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.clone())
    }

    /// Returns a transaction coordinator bound to this pool.
    pub fn transactions(&self) -> TransactionManager {
        TransactionManager::new(self.clone())
    }

    /// Returns a health checker bound to this pool.
    pub fn health(&self) -> HealthChecker {
        HealthChecker::new(self.clone())
    }

    /// Closes the database connection pool.
    ///
    /// After calling close, all repository operations fail with
    /// `ConnectionFailed`.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check(Duration::from_secs(1)).await.is_ok());

        let stats = db.stats();
        assert_eq!(stats.max_open_connections, 1);
        assert!(stats.open_connections <= 1);
    }

    #[test]
    fn test_config_defaults_and_builder() {
        let config = DbConfig::new("/tmp/test.db");
        assert_eq!(config.max_connections, 25);
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(300)));

        let config = config.max_connections(10).min_connections(2).max_idle_time(None);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_idle_time, None);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = DbConfig::in_memory().max_connections(0);
        let err = Database::new(config).await.unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
    }

    #[tokio::test]
    async fn test_closed_pool_fails_health_check() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(db.is_closed());

        let err = db.health_check(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_lifetime_hook_counts_closed_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig::new(dir.path().join("hooks.db"))
            .max_connections(2)
            .min_connections(0)
            .max_lifetime(Some(Duration::ZERO));
        let db = Database::new(config).await.unwrap();

        let conn = db.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(conn);

        // Release runs on a background task.
        for _ in 0..50 {
            if db.stats().max_lifetime_closed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(db.stats().max_lifetime_closed > 0);
    }
}
