//! # Ambient Transactions
//!
//! A request-scoped [`Scope`] carries at most one live transaction. Every
//! repository call reads it: with a transaction present the call joins it,
//! without one the call auto-commits on a pooled connection.
//!
//! ## Unit of Work
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  run_in_transaction(scope, f)                                          │
//! │       │                                                                 │
//! │       ├── scope already holds a transaction? ──► f(scope)  (joined)    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  BEGIN ──► child scope { tx } ──► f(child)                             │
//! │                                      │                                  │
//! │             ┌────────────────────────┼────────────────────────┐        │
//! │             ▼                        ▼                        ▼        │
//! │          Ok(value)                 Err(e)                  panic       │
//! │           COMMIT                  ROLLBACK                ROLLBACK     │
//! │        (failure → Commit      (failure → RollbackFailed   resume the   │
//! │         stage error)            carrying both)              panic      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nesting is flattened: there are no savepoints, so an inner failure that
//! propagates rolls back everything the outer body did too.

use futures_util::FutureExt;
use sqlx::{Sqlite, Transaction};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{DbError, DbResult, TxStage};
use crate::pool::Database;

// =============================================================================
// Transaction Options
// =============================================================================

/// Isolation preset for a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for beginning a transaction.
///
/// SQLite has no per-transaction isolation levels. Read-committed begins
/// a deferred transaction; repeatable-read and serializable begin an
/// immediate one, taking the write lock up front. Read-only switches the
/// connection to `PRAGMA query_only` for the transaction's lifetime, and the
/// repository layer reports any write attempt as `ReadOnly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    pub fn read_committed() -> Self {
        TxOptions::default()
    }

    pub fn repeatable_read() -> Self {
        TxOptions {
            isolation: IsolationLevel::RepeatableRead,
            read_only: false,
        }
    }

    pub fn serializable() -> Self {
        TxOptions {
            isolation: IsolationLevel::Serializable,
            read_only: false,
        }
    }

    pub fn read_only() -> Self {
        TxOptions {
            isolation: IsolationLevel::ReadCommitted,
            read_only: true,
        }
    }

    /// SQL used to open the transaction.
    pub fn begin_statement(&self) -> &'static str {
        match self.isolation {
            IsolationLevel::ReadCommitted => "BEGIN",
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => "BEGIN IMMEDIATE",
        }
    }
}

// =============================================================================
// Transaction Handle
// =============================================================================

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

type SqliteTx = Transaction<'static, Sqlite>;

struct TxInner {
    id: u64,
    options: TxOptions,
    tx: Mutex<Option<SqliteTx>>,
}

/// Opaque token for one live transaction.
///
/// Clones share the transaction. Statements serialize on an internal lock,
/// since a transaction is pinned to a single connection.
#[derive(Clone)]
pub struct TxHandle {
    inner: Arc<TxInner>,
}

impl TxHandle {
    fn new(tx: SqliteTx, options: TxOptions) -> Self {
        TxHandle {
            inner: Arc::new(TxInner {
                id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
                options,
                tx: Mutex::new(Some(tx)),
            }),
        }
    }

    /// Process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn options(&self) -> TxOptions {
        self.inner.options
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.options.read_only
    }

    /// Two handles refer to the same transaction.
    pub fn same_as(&self, other: &TxHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Locks the transaction for one statement. `None` once finished.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<SqliteTx>> {
        self.inner.tx.lock().await
    }

    async fn commit(&self) -> DbResult<()> {
        let tx = self.inner.tx.lock().await.take();
        match tx {
            Some(tx) => tx.commit().await.map_err(|source| DbError::Transaction {
                stage: TxStage::Commit,
                source,
            }),
            None => Err(DbError::TransactionClosed),
        }
    }

    async fn rollback(&self) -> Result<(), sqlx::Error> {
        let tx = self.inner.tx.lock().await.take();
        match tx {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.inner.id)
            .field("options", &self.inner.options)
            .finish()
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Request-scoped carrier for the ambient transaction and cancellation.
///
/// Pass it explicitly to every repository call. Only the
/// [`TransactionManager`] creates scopes that hold a transaction.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    tx: Option<TxHandle>,
    cancel: CancellationToken,
}

impl Scope {
    /// A scope with no transaction and a fresh cancellation token.
    pub fn new() -> Self {
        Scope::default()
    }

    /// A scope tied to an existing cancellation token.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Scope { tx: None, cancel }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels every round trip running under this scope (and its clones).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn with_transaction(&self, handle: TxHandle) -> Scope {
        Scope {
            tx: Some(handle),
            cancel: self.cancel.clone(),
        }
    }

    /// Drives `fut` unless the scope is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DbError::Cancelled),
            result = fut => result,
        }
    }
}

/// Returns the transaction bound to `scope`, if any.
pub fn current_transaction(scope: &Scope) -> Option<&TxHandle> {
    scope.tx.as_ref()
}

// =============================================================================
// Transaction Manager
// =============================================================================

/// Runs units of work inside a transaction.
///
/// ## Usage
/// ```rust,ignore
/// let tm = db.transactions();
/// tm.run_in_transaction(&scope, |tx_scope| async move {
///     users.create(&tx_scope, &alice).await?;
///     users.create(&tx_scope, &bob).await?;
///     Ok(())
/// })
/// .await?;
/// ```
#[derive(Debug, Clone)]
pub struct TransactionManager {
    db: Database,
}

impl TransactionManager {
    pub fn new(db: Database) -> Self {
        TransactionManager { db }
    }

    /// Runs `f` in a read-committed transaction, or joins the scope's one.
    pub async fn run_in_transaction<F, Fut, R>(&self, scope: &Scope, f: F) -> DbResult<R>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = DbResult<R>>,
    {
        self.run_in_transaction_with(scope, TxOptions::default(), f).await
    }

    /// Runs `f` in a transaction begun with `options`.
    ///
    /// When the scope already holds a transaction, `options` are ignored
    /// and `f` joins it.
    ///
    /// ## Returns
    /// * `Ok(value)` - `f` succeeded and the commit went through
    /// * `Err(e)` - `f`'s error after rollback, `RollbackFailed` if the
    ///   rollback also failed, or a `Commit` stage error
    pub async fn run_in_transaction_with<F, Fut, R>(
        &self,
        scope: &Scope,
        options: TxOptions,
        f: F,
    ) -> DbResult<R>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = DbResult<R>>,
    {
        if let Some(handle) = current_transaction(scope) {
            debug!(tx_id = handle.id(), "Joining ambient transaction");
            return f(scope.clone()).await;
        }

        let tx = scope.run(self.db.begin(options)).await?;
        let handle = TxHandle::new(tx, options);
        let child = scope.with_transaction(handle.clone());
        debug!(
            tx_id = handle.id(),
            isolation = ?options.isolation,
            read_only = options.read_only,
            "Transaction started"
        );

        let outcome = AssertUnwindSafe(async move { f(child).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                handle.commit().await?;
                debug!(tx_id = handle.id(), "Transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => match handle.rollback().await {
                Ok(()) => {
                    debug!(tx_id = handle.id(), error = %err, "Transaction rolled back");
                    Err(err)
                }
                Err(rollback) => {
                    error!(tx_id = handle.id(), error = %err, rollback_error = %rollback, "Rollback failed");
                    Err(DbError::RollbackFailed {
                        original: Box::new(err),
                        rollback,
                    })
                }
            },
            Err(panic) => {
                if let Err(rollback) = handle.rollback().await {
                    error!(tx_id = handle.id(), rollback_error = %rollback, "Rollback after panic failed");
                } else {
                    warn!(tx_id = handle.id(), "Transaction rolled back after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::user::UserRepository;
    use crate::repository::{BaseRepository, Repository};
    use crate::test_support::TestDb;
    use keystone_core::User;
    use std::time::Duration;

    fn user(email: &str) -> User {
        User::new(email, "hash", "Test", "User")
    }

    #[test]
    fn test_begin_statements() {
        assert_eq!(TxOptions::read_committed().begin_statement(), "BEGIN");
        assert_eq!(TxOptions::repeatable_read().begin_statement(), "BEGIN IMMEDIATE");
        assert_eq!(TxOptions::serializable().begin_statement(), "BEGIN IMMEDIATE");
        assert!(TxOptions::read_only().read_only);
        assert_eq!(TxOptions::read_only().begin_statement(), "BEGIN");
    }

    #[tokio::test]
    async fn test_commit_persists_work() {
        let t = TestDb::migrated().await;
        let users = t.db.users();
        let scope = Scope::new();
        let alice = user("alice@doe.com");

        t.db.transactions()
            .run_in_transaction(&scope, |tx| {
                let users = users.clone();
                let alice = alice.clone();
                async move {
                    assert!(current_transaction(&tx).is_some());
                    users.create(&tx, &alice).await
                }
            })
            .await
            .unwrap();

        assert!(current_transaction(&scope).is_none());
        assert!(users.exists(&scope, &alice.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_nested_call_joins_and_inner_failure_rolls_back_outer_work() {
        let t = TestDb::migrated().await;
        let tm = t.db.transactions();
        let users = t.db.users();
        let scope = Scope::new();
        let alice = user("alice@doe.com");

        let result: DbResult<()> = tm
            .run_in_transaction(&scope, |outer| {
                let tm = tm.clone();
                let users = users.clone();
                let alice = alice.clone();
                async move {
                    users.create(&outer, &alice).await?;
                    let outer_handle = current_transaction(&outer).cloned();

                    tm.run_in_transaction(&outer, |inner| async move {
                        let inner_handle = current_transaction(&inner).cloned();
                        assert!(outer_handle.unwrap().same_as(&inner_handle.unwrap()));
                        Err(DbError::kind_of(keystone_core::ErrorKind::InvalidInput, "test", "users"))
                    })
                    .await
                }
            })
            .await;

        assert!(result.unwrap_err().is_invalid_input());
        assert!(!users.exists(&scope, &alice.id).await.unwrap());
    }

    async fn create_then_panic(users: UserRepository, tx: Scope, alice: User) -> DbResult<()> {
        users.create(&tx, &alice).await?;
        panic!("boom");
    }

    #[tokio::test]
    async fn test_panic_rolls_back_and_resumes() {
        let t = TestDb::migrated().await;
        let db = t.db.clone();
        let alice = user("alice@doe.com");
        let id = alice.id.clone();

        let handle = tokio::spawn(async move {
            let users = db.users();
            db.transactions()
                .run_in_transaction(&Scope::new(), |tx| create_then_panic(users, tx, alice))
                .await
        });

        let join = handle.await;
        assert!(join.unwrap_err().is_panic());
        assert!(!t.db.users().exists(&Scope::new(), &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let t = TestDb::migrated().await;
        let users = t.db.users();

        let err = t
            .db
            .transactions()
            .run_in_transaction_with(&Scope::new(), TxOptions::read_only(), |tx| {
                let users = users.clone();
                async move {
                    assert_eq!(users.count(&tx, &Default::default()).await?, 0);
                    users.create(&tx, &user("ro@doe.com")).await
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::ReadOnly { .. }));
        assert!(err.is_transaction_error());
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes_through_fetch() {
        let t = TestDb::migrated().await;
        // A single connection, so the write afterwards reuses it.
        let db = Database::new(TestDb::config(&t.path).max_connections(1))
            .await
            .unwrap();
        let users = db.users();
        let alice = user("alice@doe.com");
        users.create(&Scope::new(), &alice).await.unwrap();

        let base: BaseRepository<User, String> = BaseRepository::new(db.clone(), "users", "id");
        let sql = "UPDATE users SET first_name = 'Mallory' WHERE id = ?1 \
                   RETURNING id, email, password_hash, first_name, last_name, status, \
                   created_at, updated_at, version";
        let err = db
            .transactions()
            .run_in_transaction_with(&Scope::new(), TxOptions::read_only(), |tx| {
                let id = alice.id.clone();
                async move { base.fetch_one(&tx, "update", sql, vec![id.into()]).await }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::ReadOnly { .. }), "unexpected error: {err}");
        let stored = users.get_by_id(&Scope::new(), &alice.id).await.unwrap();
        assert_eq!(stored.first_name, "Test");
        assert_eq!(stored.version, 1);

        // The connection went back to the pool writable.
        users.create(&Scope::new(), &user("bob@doe.com")).await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_serializable_preset_commits() {
        let t = TestDb::migrated().await;
        let users = t.db.users();
        let scope = Scope::new();

        let count = t
            .db
            .transactions()
            .run_in_transaction_with(&scope, TxOptions::serializable(), |tx| {
                let users = users.clone();
                async move {
                    users.create(&tx, &user("s@doe.com")).await?;
                    users.count(&tx, &Default::default()).await
                }
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_scope_aborts_and_rolls_back() {
        let t = TestDb::migrated().await;
        let users = t.db.users();
        let scope = Scope::new();
        let alice = user("alice@doe.com");

        let err = t
            .db
            .transactions()
            .run_in_transaction(&scope, |tx| {
                let users = users.clone();
                let alice = alice.clone();
                async move {
                    users.create(&tx, &alice).await?;
                    tx.cancel();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    users.count(&tx, &Default::default()).await
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), keystone_core::ErrorKind::Cancelled);
        assert!(!users.exists(&Scope::new(), &alice.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_scope_never_begins() {
        let t = TestDb::migrated().await;
        let scope = Scope::new();
        scope.cancel();

        let err = t
            .db
            .transactions()
            .run_in_transaction(&scope, |_tx| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Cancelled));
    }
}
