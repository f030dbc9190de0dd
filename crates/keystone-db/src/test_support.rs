//! Shared fixtures for the crate's tests.

use std::path::PathBuf;
use tempfile::TempDir;

use crate::migrate::{MigrationRunner, MigrationSource};
use crate::pool::{Database, DbConfig};

/// The repository's own migration scripts.
pub(crate) const MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../migrations/sqlite");

/// A file-backed database in a temporary directory.
///
/// File-backed so every pooled connection sees the same data; an in-memory
/// SQLite database is private to one connection.
pub(crate) struct TestDb {
    _dir: TempDir,
    pub path: PathBuf,
    pub db: Database,
}

impl TestDb {
    /// Empty database, no schema.
    pub async fn empty() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::new(Self::config(&path)).await.unwrap();
        TestDb { _dir: dir, path, db }
    }

    /// Database with every migration in `migrations/sqlite` applied.
    pub async fn migrated() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let config = Self::config(&path);

        let source = MigrationSource::from_dir(MIGRATIONS_DIR).unwrap();
        let mut runner = MigrationRunner::connect(&config, source).await.unwrap();
        runner.up().await.unwrap();
        runner.close().await.unwrap();

        let db = Database::new(config).await.unwrap();
        TestDb { _dir: dir, path, db }
    }

    pub fn config(path: &std::path::Path) -> DbConfig {
        DbConfig::new(path).max_connections(5).min_connections(0)
    }
}
