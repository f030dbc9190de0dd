//! # keystone-db: Database Layer for Keystone
//!
//! Connection pooling, ambient transactions, versioned repositories, and
//! schema migrations over SQLite with sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Keystone Data Flow                               │
//! │                                                                         │
//! │  Handler (owns a Scope per request)                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   keystone-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │ (repository/) │    │  (migrate/)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ Repository    │    │ Runner       │  │   │
//! │  │   │ Health        │    │ BaseRepository│    │ Manager      │  │   │
//! │  │   │ Transactions  │    │ UserRepository│    │ Source       │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Settings file and environment overrides
//! - [`pool`] - Connection pool creation, configuration, and statistics
//! - [`health`] - Health checks
//! - [`txn`] - Request scope and the transaction coordinator
//! - [`repository`] - Generic repository and the user repository
//! - [`migrate`] - Migration runner and manager
//! - [`manager`] - Startup wiring of all of the above
//! - [`error`] - Error translation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keystone_db::{Database, DbConfig, Repository, Scope};
//!
//! let db = Database::new(DbConfig::new("app.db")).await?;
//! let scope = Scope::new();
//!
//! db.transactions()
//!     .run_in_transaction(&scope, |scope| async move {
//!         let mut user = db.users().get_by_id(&scope, &id).await?;
//!         user.first_name = "Ada".into();
//!         user.bump_version();
//!         db.users().update(&scope, &user).await
//!     })
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod migrate;
pub mod pool;
pub mod repository;
pub mod txn;

#[cfg(test)]
pub(crate) mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConfigError, Settings};
pub use error::{translate, DbError, DbResult, MigrationError, MigrationResult};
pub use health::{Health, HealthChecker, HealthStatus};
pub use manager::DatabaseManager;
pub use migrate::{Migration, MigrationManager, MigrationRunner, MigrationSource};
pub use pool::{Database, DbConfig, PoolStats};
pub use repository::user::UserRepository;
pub use repository::{BaseRepository, Repository};
pub use txn::{
    current_transaction, IsolationLevel, Scope, TransactionManager, TxHandle, TxOptions,
};
