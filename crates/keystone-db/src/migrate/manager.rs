//! # Migration Manager
//!
//! File-level view of a migrations directory: listing, validation, status,
//! and scaffolding new script pairs. Execution is delegated to a
//! [`MigrationRunner`] that re-reads the directory before every run.
//!
//! ## Directory Layout
//! ```text
//! migrations/sqlite/
//! ├── 001_create_users_table.up.sql
//! ├── 001_create_users_table.down.sql
//! ├── 002_add_user_index.up.sql
//! └── 002_add_user_index.down.sql
//! ```

use chrono::Utc;
use keystone_core::migration::{
    clean_name, contains_sql, file_name, script_template, Direction, MigrationInfo,
};
use keystone_core::MigrationStatus;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::runner::MigrationRunner;
use super::source::{discover, io_error, MigrationSource};
use crate::error::{DbResult, MigrationError, MigrationResult};
use crate::pool::DbConfig;

/// Manages the migrations in one directory against one database.
#[derive(Debug)]
pub struct MigrationManager {
    dir: PathBuf,
    runner: MigrationRunner,
}

impl MigrationManager {
    /// Opens the runner's connection and loads the scripts in `dir`.
    pub async fn new(config: &DbConfig, dir: impl Into<PathBuf>) -> DbResult<Self> {
        let dir = dir.into();
        let source = MigrationSource::from_dir(&dir)?;
        let runner = MigrationRunner::connect(config, source).await?;
        Ok(MigrationManager { dir, runner })
    }

    /// Wraps an already connected runner.
    pub fn with_runner(dir: impl Into<PathBuf>, runner: MigrationRunner) -> Self {
        MigrationManager {
            dir: dir.into(),
            runner,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Complete up/down pairs, sorted by version.
    pub fn list_migrations(&self) -> MigrationResult<Vec<MigrationInfo>> {
        Ok(discover(&self.dir)?
            .into_values()
            .filter(MigrationInfo::is_complete)
            .collect())
    }

    /// Checks the directory for gaps, half pairs, and empty scripts.
    ///
    /// Every version from 1 to the highest one present must have both
    /// scripts, and each script must contain at least one SQL statement.
    pub fn validate_migrations(&self) -> MigrationResult<()> {
        let found = discover(&self.dir)?;
        let Some(&latest) = found.keys().next_back() else {
            return Ok(());
        };

        for version in 1..=latest {
            let info = found
                .get(&version)
                .ok_or(MigrationError::VersionGap { expected: version })?;

            for direction in [Direction::Up, Direction::Down] {
                let file = info
                    .file(direction)
                    .ok_or(MigrationError::MissingScript { version, direction })?;

                let path = self.dir.join(file);
                let content = fs::read_to_string(&path).map_err(|source| io_error(&path, source))?;
                if !contains_sql(&content) {
                    return Err(MigrationError::EmptyScript {
                        file: file.to_string(),
                        direction,
                    });
                }
            }
        }

        Ok(())
    }

    /// Writes an empty up/down pair at the next version.
    ///
    /// ## Arguments
    /// * `name` - Free text; lowercased, spaces and hyphens become `_`
    ///
    /// ## Returns
    /// The new pair, or `InvalidName`/`AlreadyExists`. If the down script
    /// cannot be written the up script is removed again.
    pub fn create_migration(&self, name: &str) -> MigrationResult<MigrationInfo> {
        if name.trim().is_empty() {
            return Err(MigrationError::InvalidName(name.to_string()));
        }
        let cleaned = clean_name(name);

        fs::create_dir_all(&self.dir).map_err(|source| io_error(&self.dir, source))?;
        let version = self
            .list_migrations()?
            .last()
            .map_or(1, |latest| latest.version + 1);

        let up_file = file_name(version, &cleaned, Direction::Up);
        let down_file = file_name(version, &cleaned, Direction::Down);
        let up_path = self.dir.join(&up_file);
        let down_path = self.dir.join(&down_file);

        for path in [&up_path, &down_path] {
            if path.exists() {
                return Err(MigrationError::AlreadyExists(path.display().to_string()));
            }
        }

        let created = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        fs::write(&up_path, script_template(Direction::Up, name, &created))
            .map_err(|source| io_error(&up_path, source))?;

        if let Err(source) = fs::write(&down_path, script_template(Direction::Down, name, &created)) {
            if let Err(e) = fs::remove_file(&up_path) {
                warn!(path = %up_path.display(), error = %e, "Failed to remove orphaned up script");
            }
            return Err(io_error(&down_path, source));
        }

        info!(version, up = %up_file, down = %down_file, "Created migration");

        Ok(MigrationInfo {
            version,
            name: cleaned,
            up_file: Some(up_file),
            down_file: Some(down_file),
            description: name.to_string(),
        })
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Applied vs. pending migrations at the current schema version.
    pub async fn status(&mut self) -> MigrationResult<MigrationStatus> {
        let (current, dirty) = self.runner.version().await?;
        Ok(MigrationStatus::new(current, dirty, self.list_migrations()?))
    }

    pub async fn version(&mut self) -> MigrationResult<(u32, bool)> {
        self.runner.version().await
    }

    pub async fn migrate_up(&mut self) -> MigrationResult<usize> {
        self.reload()?;
        self.runner.up().await
    }

    pub async fn migrate_down(&mut self) -> MigrationResult<usize> {
        self.reload()?;
        self.runner.down().await
    }

    pub async fn migrate_steps(&mut self, n: i64) -> MigrationResult<usize> {
        self.reload()?;
        self.runner.steps(n).await
    }

    pub async fn migrate_to(&mut self, version: u32) -> MigrationResult<usize> {
        self.reload()?;
        self.runner.migrate_to(version).await
    }

    pub async fn force(&mut self, version: u32) -> MigrationResult<()> {
        self.reload()?;
        self.runner.force(version).await
    }

    pub async fn close(self) -> MigrationResult<()> {
        self.runner.close().await
    }

    fn reload(&mut self) -> MigrationResult<()> {
        self.runner.set_source(MigrationSource::from_dir(&self.dir)?);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _db_dir: TempDir,
        scripts: TempDir,
        manager: MigrationManager,
    }

    impl Fixture {
        async fn new() -> Self {
            let db_dir = tempfile::tempdir().unwrap();
            let scripts = tempfile::tempdir().unwrap();
            let config = DbConfig::new(db_dir.path().join("manager.db"));
            let manager = MigrationManager::new(&config, scripts.path()).await.unwrap();
            Fixture {
                _db_dir: db_dir,
                scripts,
                manager,
            }
        }

        fn write(&self, name: &str, body: &str) {
            fs::write(self.scripts.path().join(name), body).unwrap();
        }

        fn write_pair(&self, version: u32, name: &str, up: &str, down: &str) {
            self.write(&file_name(version, name, Direction::Up), up);
            self.write(&file_name(version, name, Direction::Down), down);
        }
    }

    #[tokio::test]
    async fn test_list_only_returns_complete_pairs() {
        let f = Fixture::new().await;
        f.write_pair(1, "init", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        f.write("002_half.up.sql", "CREATE TABLE b (id INTEGER);");

        let listed = f.manager.list_migrations().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, 1);
        assert_eq!(listed[0].name, "init");
    }

    #[tokio::test]
    async fn test_validate_reports_missing_version() {
        let f = Fixture::new().await;
        f.write_pair(1, "init", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        f.write("003_add_col.up.sql", "ALTER TABLE a ADD COLUMN b TEXT;");

        let err = f.manager.validate_migrations().unwrap_err();
        assert!(matches!(err, MigrationError::VersionGap { expected: 2 }));
        assert!(err.to_string().contains("missing version 2"));
    }

    #[tokio::test]
    async fn test_validate_reports_missing_down_script() {
        let f = Fixture::new().await;
        f.write_pair(1, "init", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        f.write("002_add_col.up.sql", "ALTER TABLE a ADD COLUMN b TEXT;");

        let err = f.manager.validate_migrations().unwrap_err();
        assert!(matches!(
            err,
            MigrationError::MissingScript { version: 2, direction: Direction::Down }
        ));
    }

    #[tokio::test]
    async fn test_validate_reports_comment_only_script() {
        let f = Fixture::new().await;
        f.write_pair(1, "init", "CREATE TABLE a (id INTEGER);", "-- nothing here\n\n");

        let err = f.manager.validate_migrations().unwrap_err();
        match err {
            MigrationError::EmptyScript { file, direction } => {
                assert_eq!(file, "001_init.down.sql");
                assert_eq!(direction, Direction::Down);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_validate_accepts_well_formed_directory() {
        let f = Fixture::new().await;
        assert!(f.manager.validate_migrations().is_ok());

        f.write_pair(1, "init", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        f.write_pair(2, "add_b", "CREATE TABLE b (id INTEGER);", "DROP TABLE b;");
        assert!(f.manager.validate_migrations().is_ok());
    }

    #[tokio::test]
    async fn test_create_migration_writes_templates() {
        let f = Fixture::new().await;
        f.write_pair(1, "init", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");

        let info = f.manager.create_migration("Add User-Index").unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(info.name, "add_user_index");
        assert_eq!(info.up_file.as_deref(), Some("002_add_user_index.up.sql"));

        let up = fs::read_to_string(f.scripts.path().join("002_add_user_index.up.sql")).unwrap();
        assert!(up.starts_with("-- Migration: Add User-Index"));
        assert!(!contains_sql(&up));

        // A fresh template is flagged until someone fills it in
        assert!(matches!(
            f.manager.validate_migrations().unwrap_err(),
            MigrationError::EmptyScript { .. }
        ));
    }

    #[tokio::test]
    async fn test_create_migration_rejects_blank_name() {
        let f = Fixture::new().await;
        let err = f.manager.create_migration("   ").unwrap_err();
        assert!(matches!(err, MigrationError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_create_migration_refuses_to_overwrite() {
        let f = Fixture::new().await;
        // A half pair is not listed, so the next version collides with it
        f.write("001_seed.down.sql", "DELETE FROM a;");

        let err = f.manager.create_migration("seed").unwrap_err();
        assert!(matches!(err, MigrationError::AlreadyExists(_)));
        assert!(!f.scripts.path().join("001_seed.up.sql").exists());
    }

    #[tokio::test]
    async fn test_status_and_execution_follow_the_directory() {
        let mut f = Fixture::new().await;
        f.write_pair(1, "init", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        f.write_pair(2, "add_b", "CREATE TABLE b (id INTEGER);", "DROP TABLE b;");

        let status = f.manager.status().await.unwrap();
        assert_eq!(status.pending_count, 2);
        assert!(status.needs_migration());

        // Files written after construction are picked up
        assert_eq!(f.manager.migrate_steps(1).await.unwrap(), 1);
        let status = f.manager.status().await.unwrap();
        assert_eq!((status.current_version, status.applied_count, status.pending_count), (1, 1, 1));

        assert_eq!(f.manager.migrate_up().await.unwrap(), 1);
        assert!(f.manager.status().await.unwrap().is_up_to_date());

        f.manager.migrate_to(1).await.unwrap();
        assert_eq!(f.manager.version().await.unwrap(), (1, false));

        f.manager.migrate_down().await.unwrap();
        assert_eq!(f.manager.version().await.unwrap(), (0, false));

        f.manager.force(2).await.unwrap();
        assert_eq!(f.manager.version().await.unwrap(), (2, false));

        f.manager.close().await.unwrap();
    }
}
