//! # Database Manager
//!
//! Startup wiring: pool, health checker, and migrations in one handle.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DatabaseManager::new(config, migrations_dir)                          │
//! │       ├── Database::new(config)           open pool, ping              │
//! │       ├── validate_connection()           BEGIN / SELECT 1 / ROLLBACK  │
//! │       └── MigrationManager::new(...)      admin connection + scripts   │
//! │                                                                         │
//! │  manager.initialize(&scope, run_migrations)                            │
//! │       ├── wait_for_connection(30 × 2s)                                 │
//! │       ├── migrate_up() + log version      (if run_migrations)          │
//! │       └── check()                         must report healthy          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{DbError, DbResult};
use crate::health::{HealthChecker, HealthStatus};
use crate::migrate::MigrationManager;
use crate::pool::{Database, DbConfig};
use crate::txn::Scope;

const WAIT_RETRIES: u32 = 30;
const WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Owns the pool, its health checker, and the migration manager.
#[derive(Debug)]
pub struct DatabaseManager {
    db: Database,
    health: HealthChecker,
    migrations: MigrationManager,
    wait_retries: u32,
    wait_interval: Duration,
}

impl DatabaseManager {
    /// Connects, validates the connection, and prepares migrations.
    ///
    /// The pool is closed again if any later step fails.
    pub async fn new(config: DbConfig, migrations_dir: impl Into<PathBuf>) -> DbResult<Self> {
        let db = Database::new(config).await?;
        let health = db.health();

        if let Err(e) = health.validate_connection().await {
            db.close().await;
            return Err(e);
        }

        let migrations = match MigrationManager::new(db.config(), migrations_dir).await {
            Ok(migrations) => migrations,
            Err(e) => {
                db.close().await;
                return Err(e);
            }
        };

        Ok(DatabaseManager {
            db,
            health,
            migrations,
            wait_retries: WAIT_RETRIES,
            wait_interval: WAIT_INTERVAL,
        })
    }

    /// Builds a manager from loaded [`Settings`].
    pub async fn from_settings(settings: &Settings) -> DbResult<Self> {
        Self::new(settings.db_config(), settings.migrations.dir.clone()).await
    }

    /// Overrides how long [`DatabaseManager::initialize`] waits for the
    /// database.
    pub fn wait_policy(mut self, retries: u32, interval: Duration) -> Self {
        self.wait_retries = retries;
        self.wait_interval = interval;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn migrations(&mut self) -> &mut MigrationManager {
        &mut self.migrations
    }

    /// Waits for the database, optionally migrates, then checks health.
    pub async fn initialize(&mut self, scope: &Scope, run_migrations: bool) -> DbResult<()> {
        info!("Initializing database");

        self.health
            .wait_for_connection(scope, self.wait_retries, self.wait_interval)
            .await?;

        if run_migrations {
            info!("Running database migrations");
            self.migrations.migrate_up().await?;

            match self.migrations.version().await {
                Ok((version, dirty)) => info!(version, dirty, "Database migration version"),
                Err(e) => warn!(error = %e, "Could not read migration version"),
            }
        }

        let status = self.health.check().await;
        if !status.is_healthy() {
            return Err(DbError::connection(
                format!("database health check failed: {}", status.message),
                None,
            ));
        }

        info!(latency_ms = status.latency_ms, "Database initialized");
        Ok(())
    }

    pub async fn health_status(&self) -> HealthStatus {
        self.health.check().await
    }

    /// Closes the migration connection and the pool.
    ///
    /// Both are closed even if the first fails; the migration error is
    /// returned.
    pub async fn close(self) -> DbResult<()> {
        info!("Closing database connections");

        let result = self.migrations.close().await;
        if let Err(e) = &result {
            error!(error = %e, "Error closing migration runner");
        }
        self.db.close().await;

        result.map_err(DbError::from)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use crate::test_support::{TestDb, MIGRATIONS_DIR};
    use keystone_core::UserFilter;

    #[tokio::test]
    async fn test_initialize_runs_migrations() {
        let t = TestDb::empty().await;
        let config = TestDb::config(&t.path);

        let mut manager = DatabaseManager::new(config, MIGRATIONS_DIR).await.unwrap();
        manager.initialize(&Scope::new(), true).await.unwrap();

        let status = manager.migrations().status().await.unwrap();
        assert!(status.is_up_to_date());
        assert!(status.current_version >= 1);

        let count = manager
            .database()
            .users()
            .count(&Scope::new(), &UserFilter::default())
            .await
            .unwrap();
        assert_eq!(count, 0);

        assert!(manager.health_status().await.is_healthy());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_without_migrations_leaves_schema_alone() {
        let t = TestDb::empty().await;
        let config = TestDb::config(&t.path);

        let mut manager = DatabaseManager::new(config, MIGRATIONS_DIR).await.unwrap();
        manager.initialize(&Scope::new(), false).await.unwrap();

        assert_eq!(manager.migrations().version().await.unwrap(), (0, false));
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_fails_on_closed_pool() {
        let t = TestDb::empty().await;
        let config = TestDb::config(&t.path);

        let mut manager = DatabaseManager::new(config, MIGRATIONS_DIR)
            .await
            .unwrap()
            .wait_policy(2, Duration::from_millis(1));
        manager.database().close().await;

        let err = manager.initialize(&Scope::new(), true).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_missing_migrations_dir_fails_construction() {
        let t = TestDb::empty().await;
        let config = TestDb::config(&t.path);

        let err = DatabaseManager::new(config, t.path.with_file_name("no-such-dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Migration(_)));
    }

    #[tokio::test]
    async fn test_from_settings() {
        let t = TestDb::empty().await;
        let mut settings = Settings::default();
        settings.database.path = t.path.clone();
        settings.database.min_connections = 0;
        settings.migrations.dir = PathBuf::from(MIGRATIONS_DIR);

        let mut manager = DatabaseManager::from_settings(&settings).await.unwrap();
        manager
            .initialize(&Scope::new(), settings.migrations.run_on_startup)
            .await
            .unwrap();
        assert!(manager.migrations().status().await.unwrap().is_up_to_date());
        manager.close().await.unwrap();
    }
}
