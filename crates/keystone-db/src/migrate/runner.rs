//! # Migration Runner
//!
//! Applies migrations over a dedicated connection and tracks the schema
//! version in a single-row `schema_migrations` table.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   clean@0 ──steps(+1)──► clean@1 ──steps(+1)──► clean@2 ...            │
//! │      ▲                      │                                           │
//! │      └──────steps(-1)───────┘                                           │
//! │                                                                         │
//! │   a failing script leaves dirty@target                                 │
//! │   dirty@v ──any step──► Err(Dirty)                                     │
//! │   dirty@v ──force(w)──► clean@w   (no script runs)                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## One Step
//! 1. Write `dirty@target` (auto-commit)
//! 2. `BEGIN`
//! 3. Run the script
//! 4. Write `clean@target`
//! 5. `COMMIT`
//!
//! A failure in 3-5 rolls back the transaction and leaves `dirty@target`.
//! A failure in 1 changes nothing: each state write replaces the row in
//! its own transaction.

use keystone_core::migration::Direction;
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, info, warn};

use super::source::{Migration, MigrationSource};
use crate::error::{DbError, DbResult, MigrationError, MigrationResult};
use crate::pool::DbConfig;

const CREATE_STATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER NOT NULL,
    dirty INTEGER NOT NULL
)";

/// Executes migrations from a [`MigrationSource`].
#[derive(Debug)]
pub struct MigrationRunner {
    conn: SqliteConnection,
    source: MigrationSource,
}

impl MigrationRunner {
    /// Opens an administrative connection to the database in `config`.
    ///
    /// The connection is separate from any pool and lives until
    /// [`MigrationRunner::close`].
    pub async fn connect(config: &DbConfig, source: MigrationSource) -> DbResult<Self> {
        let options = config.connect_options()?;
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| DbError::connection("failed to open migration connection", Some(e)))?;

        Ok(Self::with_connection(conn, source).await?)
    }

    /// Wraps an existing connection, creating the state table if needed.
    pub async fn with_connection(
        mut conn: SqliteConnection,
        source: MigrationSource,
    ) -> MigrationResult<Self> {
        sqlx::query(CREATE_STATE_TABLE)
            .execute(&mut conn)
            .await
            .map_err(MigrationError::State)?;

        debug!(migrations = source.len(), "Migration runner ready");
        Ok(MigrationRunner { conn, source })
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    /// Replaces the script set, e.g. after files were added on disk.
    pub fn set_source(&mut self, source: MigrationSource) {
        self.source = source;
    }

    /// Current `(version, dirty)`; `(0, false)` before the first migration.
    ///
    /// ## Returns
    /// * `Err(CorruptState)` - The stored version is negative or too large
    pub async fn version(&mut self) -> MigrationResult<(u32, bool)> {
        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT version, dirty FROM schema_migrations LIMIT 1")
                .fetch_optional(&mut self.conn)
                .await
                .map_err(MigrationError::State)?;

        match row {
            Some((version, dirty)) => {
                let version =
                    u32::try_from(version).map_err(|_| MigrationError::CorruptState(version))?;
                Ok((version, dirty))
            }
            None => Ok((0, false)),
        }
    }

    /// Applies every pending migration. Returns how many ran.
    pub async fn up(&mut self) -> MigrationResult<usize> {
        let (current, _) = self.clean_version().await?;
        let pending = self.source.pending(current).count();
        self.run_steps(current, Direction::Up, pending).await
    }

    /// Reverts every applied migration. Returns how many ran.
    pub async fn down(&mut self) -> MigrationResult<usize> {
        let (current, _) = self.clean_version().await?;
        let applied = self.source.applied(current).count();
        self.run_steps(current, Direction::Down, applied).await
    }

    /// Moves `n` migrations forward (`n > 0`) or back (`n < 0`).
    ///
    /// ## Returns
    /// * `Err(Dirty)` - The last attempt failed; use [`MigrationRunner::force`]
    /// * `Err(ShortLimit)` - Fewer than `|n|` migrations exist in that
    ///   direction; nothing was executed
    pub async fn steps(&mut self, n: i64) -> MigrationResult<usize> {
        let (current, _) = self.clean_version().await?;

        let (direction, available) = if n >= 0 {
            (Direction::Up, self.source.pending(current).count())
        } else {
            (Direction::Down, self.source.applied(current).count())
        };

        let requested = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
        if requested > available {
            return Err(MigrationError::ShortLimit {
                requested: n,
                available,
            });
        }

        self.run_steps(current, direction, requested).await
    }

    /// Moves to exactly `target`; a no-op when already there.
    pub async fn migrate_to(&mut self, target: u32) -> MigrationResult<usize> {
        if !self.source.is_known(target) {
            return Err(MigrationError::UnknownVersion(target));
        }
        let (current, _) = self.clean_version().await?;

        if target > current {
            let count = self
                .source
                .pending(current)
                .take_while(|m| m.version <= target)
                .count();
            self.run_steps(current, Direction::Up, count).await
        } else {
            let count = self
                .source
                .applied(current)
                .take_while(|m| m.version > target)
                .count();
            self.run_steps(current, Direction::Down, count).await
        }
    }

    /// Records `clean@version` without running any script.
    ///
    /// The only way out of a dirty state. `version` must be 0 or known.
    pub async fn force(&mut self, version: u32) -> MigrationResult<()> {
        if !self.source.is_known(version) {
            return Err(MigrationError::UnknownVersion(version));
        }
        write_state(&mut self.conn, version, false)
            .await
            .map_err(MigrationError::State)?;

        warn!(version, "Migration version forced");
        Ok(())
    }

    /// Closes the administrative connection.
    pub async fn close(self) -> MigrationResult<()> {
        self.conn.close().await.map_err(MigrationError::State)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn clean_version(&mut self) -> MigrationResult<(u32, bool)> {
        let (version, dirty) = self.version().await?;
        if dirty {
            return Err(MigrationError::Dirty { version });
        }
        Ok((version, dirty))
    }

    async fn run_steps(
        &mut self,
        mut current: u32,
        direction: Direction,
        count: usize,
    ) -> MigrationResult<usize> {
        if count == 0 {
            debug!(version = current, "No migrations to run");
            return Ok(0);
        }

        let plan: Vec<(Migration, u32)> = match direction {
            Direction::Up => self
                .source
                .pending(current)
                .take(count)
                .map(|m| (m.clone(), m.version))
                .collect(),
            Direction::Down => self
                .source
                .applied(current)
                .take(count)
                .map(|m| (m.clone(), self.source.previous_version(m.version)))
                .collect(),
        };

        for (migration, target) in &plan {
            info!(
                version = migration.version,
                name = %migration.name,
                direction = %direction,
                from = current,
                to = target,
                "Running migration"
            );
            self.apply(migration, direction, *target).await?;
            current = *target;
        }

        info!(version = current, count = plan.len(), "Migrations complete");
        Ok(plan.len())
    }

    async fn apply(
        &mut self,
        migration: &Migration,
        direction: Direction,
        target: u32,
    ) -> MigrationResult<()> {
        write_state(&mut self.conn, target, true)
            .await
            .map_err(MigrationError::State)?;

        let script_failed = |source| MigrationError::ScriptFailed {
            version: migration.version,
            direction,
            source,
        };

        let mut tx = self.conn.begin().await.map_err(script_failed)?;
        sqlx::raw_sql(migration.script(direction))
            .execute(&mut *tx)
            .await
            .map_err(script_failed)?;
        write_state(&mut tx, target, false).await.map_err(script_failed)?;
        tx.commit().await.map_err(script_failed)?;

        Ok(())
    }
}

/// Replaces the single state row. `clean@0` is stored as no row.
///
/// Delete and insert commit together; inside a running transaction they
/// nest as a savepoint.
async fn write_state(
    conn: &mut SqliteConnection,
    version: u32,
    dirty: bool,
) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;

    sqlx::query("DELETE FROM schema_migrations")
        .execute(&mut *tx)
        .await?;

    if version > 0 || dirty {
        sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES (?1, ?2)")
            .bind(i64::from(version))
            .bind(dirty)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await
}

// =============================================================================
// Unit Tests
// =============================================================================
