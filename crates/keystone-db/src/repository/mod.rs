//! # Repository Module
//!
//! The generic repository contract and the primitives entity repositories
//! are built from.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern Explained                         │
//! │                                                                         │
//! │  Handler                                                               │
//! │       │                                                                 │
//! │       │  db.users().update(&scope, &user)                              │
//! │       ▼                                                                 │
//! │  UserRepository: Repository<User, String>                              │
//! │  ├── create / get_by_id / update / delete                              │
//! │  ├── list / count / exists                                             │
//! │       │                                                                 │
//! │       │  composes                                                       │
//! │       ▼                                                                 │
//! │  BaseRepository<User, String>                                          │
//! │  ├── execute / fetch_one / fetch_optional / fetch_all / fetch_scalar   │
//! │  ├── exists_by_id / delete_by_id / update_versioned                    │
//! │       │                                                                 │
//! │       │  current_transaction(scope)?                                   │
//! │       ├── Some(tx) ──► run on the transaction's connection             │
//! │       └── None     ──► run on a pooled connection (auto-commit)        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  translate(op, table, sqlx::Error) on every failure                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`UserRepository`](user::UserRepository) - User accounts

pub mod user;

use async_trait::async_trait;
use keystone_core::{ErrorKind, SqlValue};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Arguments, FromRow, SqliteConnection};
use std::future::Future;
use std::marker::PhantomData;
use tracing::debug;

use crate::error::{translate, DbError, DbResult};
use crate::pool::Database;
use crate::txn::{current_transaction, Scope};

// =============================================================================
// Repository Contract
// =============================================================================

/// CRUD contract shared by every entity repository.
///
/// Every operation takes the request [`Scope`] and joins its transaction
/// when one is present.
#[async_trait]
pub trait Repository<T, Id>: Send + Sync
where
    T: Send + Sync,
    Id: Send + Sync + ?Sized,
{
    /// Optional listing constraints.
    type Filter: Send + Sync;

    /// Inserts a new row.
    ///
    /// ## Returns
    /// * `DuplicateKey` - a uniqueness constraint was violated
    /// * `ForeignKeyViolation` - a referenced row is missing
    /// * `InvalidInput` - a check or not-null constraint failed
    async fn create(&self, scope: &Scope, entity: &T) -> DbResult<()>;

    /// Fetches one entity or fails with `NotFound`.
    async fn get_by_id(&self, scope: &Scope, id: &Id) -> DbResult<T>;

    /// Writes `entity` if the stored row still holds `entity.version - 1`.
    ///
    /// ## Returns
    /// * `NotFound` - no row with that id
    /// * `OptimisticLock` - the row exists at another version
    async fn update(&self, scope: &Scope, entity: &T) -> DbResult<()>;

    /// Deletes by id or fails with `NotFound`.
    async fn delete(&self, scope: &Scope, id: &Id) -> DbResult<()>;

    /// Matching entities, newest first, paginated.
    ///
    /// `limit` and `offset` go to the database as given: a limit of 0
    /// returns nothing and a negative limit returns every match.
    async fn list(
        &self,
        scope: &Scope,
        filter: &Self::Filter,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<T>>;

    /// Total matching rows, ignoring pagination.
    async fn count(&self, scope: &Scope, filter: &Self::Filter) -> DbResult<i64>;

    /// Whether a row with `id` exists.
    async fn exists(&self, scope: &Scope, id: &Id) -> DbResult<bool>;
}

// =============================================================================
// Argument Binding
// =============================================================================

/// Converts positional values into SQLite arguments.
pub(crate) fn bind_args<'q>(values: Vec<SqlValue>) -> Result<SqliteArguments<'q>, sqlx::Error> {
    let mut args = SqliteArguments::default();
    for value in values {
        let added = match value {
            SqlValue::Null => args.add(Option::<String>::None),
            SqlValue::Bool(v) => args.add(v),
            SqlValue::Integer(v) => args.add(v),
            SqlValue::Real(v) => args.add(v),
            SqlValue::Text(v) => args.add(v),
            SqlValue::Timestamp(v) => args.add(v),
        };
        added.map_err(sqlx::Error::Encode)?;
    }
    Ok(args)
}

// =============================================================================
// Base Repository
// =============================================================================

/// Runs `$body` on the scope's transaction connection, or on a pooled one.
///
/// `$conn` is bound to `&mut SqliteConnection`; `$body` must evaluate to a
/// future of `Result<_, sqlx::Error>`.
macro_rules! on_connection {
    ($self:ident, $scope:ident, $op:expr, |$conn:ident| $body:expr) => {
        $scope
            .run(async {
                let op: &'static str = $op;
                match current_transaction($scope) {
                    Some(handle) => {
                        let mut guard = handle.lock().await;
                        let tx = guard.as_mut().ok_or(DbError::TransactionClosed)?;
                        let $conn: &mut SqliteConnection = &mut **tx;
                        $body.await.map_err(|e| {
                            let err = translate(op, $self.table, e);
                            if handle.is_read_only() && err.is_read_only_violation() {
                                DbError::ReadOnly {
                                    op,
                                    table: $self.table.to_string(),
                                }
                            } else {
                                err
                            }
                        })
                    }
                    None => {
                        let mut pooled = $self
                            .db
                            .acquire()
                            .await
                            .map_err(|e| translate(op, $self.table, e))?;
                        let $conn: &mut SqliteConnection = &mut *pooled;
                        $body.await.map_err(|e| translate(op, $self.table, e))
                    }
                }
            })
            .await
    };
}

/// Low-level primitives over one table.
///
/// Entity repositories hold one of these and pass it their SQL. Arguments
/// bind to `?1`, `?2`, ... in order.
pub struct BaseRepository<T, Id: ?Sized> {
    db: Database,
    table: &'static str,
    id_column: &'static str,
    _entity: PhantomData<fn() -> (T, Box<Id>)>,
}

impl<T, Id: ?Sized> Clone for BaseRepository<T, Id> {
    fn clone(&self) -> Self {
        BaseRepository {
            db: self.db.clone(),
            table: self.table,
            id_column: self.id_column,
            _entity: PhantomData,
        }
    }
}

impl<T, Id: ?Sized> std::fmt::Debug for BaseRepository<T, Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseRepository")
            .field("table", &self.table)
            .field("id_column", &self.id_column)
            .finish()
    }
}

impl<T, Id> BaseRepository<T, Id>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    Id: ?Sized + Sync,
    for<'a> &'a Id: Into<SqlValue>,
{
    pub fn new(db: Database, table: &'static str, id_column: &'static str) -> Self {
        BaseRepository {
            db,
            table,
            id_column,
            _entity: PhantomData,
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Runs a write statement and returns the number of affected rows.
    ///
    /// Rejected with `ReadOnly` inside a read-only transaction.
    pub async fn execute(
        &self,
        scope: &Scope,
        op: &'static str,
        sql: &str,
        args: Vec<SqlValue>,
    ) -> DbResult<u64> {
        if current_transaction(scope).is_some_and(|tx| tx.is_read_only()) {
            return Err(DbError::ReadOnly {
                op,
                table: self.table.to_string(),
            });
        }

        let args = bind_args(args).map_err(|e| translate(op, self.table, e))?;
        let result = on_connection!(self, scope, op, |conn| sqlx::query_with(sql, args).execute(conn))?;
        Ok(result.rows_affected())
    }

    /// Fetches exactly one row; `NotFound` when there is none.
    ///
    /// A statement that writes (`... RETURNING`) inside a read-only
    /// transaction fails with `ReadOnly`, the same as [`Self::execute`].
    pub async fn fetch_one(
        &self,
        scope: &Scope,
        op: &'static str,
        sql: &str,
        args: Vec<SqlValue>,
    ) -> DbResult<T> {
        let args = bind_args(args).map_err(|e| translate(op, self.table, e))?;
        on_connection!(self, scope, op, |conn| sqlx::query_as_with::<_, T, _>(sql, args)
            .fetch_one(conn))
    }

    /// Fetches at most one row.
    pub async fn fetch_optional(
        &self,
        scope: &Scope,
        op: &'static str,
        sql: &str,
        args: Vec<SqlValue>,
    ) -> DbResult<Option<T>> {
        let args = bind_args(args).map_err(|e| translate(op, self.table, e))?;
        on_connection!(self, scope, op, |conn| sqlx::query_as_with::<_, T, _>(sql, args)
            .fetch_optional(conn))
    }

    /// Fetches every row.
    pub async fn fetch_all(
        &self,
        scope: &Scope,
        op: &'static str,
        sql: &str,
        args: Vec<SqlValue>,
    ) -> DbResult<Vec<T>> {
        let args = bind_args(args).map_err(|e| translate(op, self.table, e))?;
        on_connection!(self, scope, op, |conn| sqlx::query_as_with::<_, T, _>(sql, args)
            .fetch_all(conn))
    }

    /// Fetches a single scalar (`COUNT(*)`, `EXISTS(...)`).
    pub async fn fetch_scalar<S>(
        &self,
        scope: &Scope,
        op: &'static str,
        sql: &str,
        args: Vec<SqlValue>,
    ) -> DbResult<S>
    where
        S: Send + Unpin,
        (S,): for<'r> FromRow<'r, SqliteRow>,
    {
        let args = bind_args(args).map_err(|e| translate(op, self.table, e))?;
        on_connection!(self, scope, op, |conn| sqlx::query_scalar_with::<_, S, _>(sql, args)
            .fetch_one(conn))
    }

    /// Whether a row with `id` exists.
    pub async fn exists_by_id(&self, scope: &Scope, id: &Id) -> DbResult<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)",
            self.table, self.id_column
        );
        let found: i64 = self.fetch_scalar(scope, "exists", &sql, vec![id.into()]).await?;
        Ok(found != 0)
    }

    /// Deletes by id; `NotFound` when nothing was deleted.
    pub async fn delete_by_id(&self, scope: &Scope, id: &Id) -> DbResult<()> {
        let sql = format!("DELETE FROM {} WHERE {} = ?1", self.table, self.id_column);
        let affected = self.execute(scope, "delete", &sql, vec![id.into()]).await?;
        if affected == 0 {
            return Err(DbError::kind_of(ErrorKind::NotFound, "delete", self.table));
        }
        Ok(())
    }

    /// Runs a version-stamped `UPDATE` and classifies a miss.
    ///
    /// `sql` must be conditional on both the id and the previous version,
    /// e.g. `... SET version = ?N WHERE id = ?1 AND version = ?N - 1`.
    ///
    /// ## How a Miss Is Classified
    /// ```text
    /// rows affected > 0                  → Ok
    /// rows affected = 0, row absent      → NotFound
    /// rows affected = 0, row present     → OptimisticLock
    /// ```
    /// The existence check runs in the same scope, so inside a transaction it
    /// sees the transaction's own writes.
    ///
    /// Inside a transaction SQLite reports a concurrent writer as
    /// `SQLITE_BUSY` instead of waiting (the snapshot this transaction read
    /// is already stale). That is the same lost race, so it is reported as
    /// `OptimisticLock` too.
    pub async fn update_versioned(
        &self,
        scope: &Scope,
        id: &Id,
        sql: &str,
        args: Vec<SqlValue>,
    ) -> DbResult<()> {
        let affected = match self.execute(scope, "update", sql, args).await {
            Ok(affected) => affected,
            Err(e) if e.is_busy() && current_transaction(scope).is_some() => {
                debug!(table = self.table, code = ?e.code(), "Versioned update lost a write race");
                return Err(e.reclassify(ErrorKind::OptimisticLock));
            }
            Err(e) => return Err(e),
        };
        if affected > 0 {
            return Ok(());
        }

        let kind = if self.exists_by_id(scope, id).await? {
            ErrorKind::OptimisticLock
        } else {
            ErrorKind::NotFound
        };
        debug!(table = self.table, kind = %kind, "Versioned update matched no rows");
        Err(DbError::kind_of(kind, "update", self.table))
    }

    /// Runs `f` in a transaction (joining the scope's one if present).
    pub async fn run_in_transaction<F, Fut, R>(&self, scope: &Scope, f: F) -> DbResult<R>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = DbResult<R>>,
    {
        self.db.transactions().run_in_transaction(scope, f).await
    }
}
