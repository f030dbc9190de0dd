//! # User Repository
//!
//! Database operations for user accounts.
//!
//! ## Key Operations
//! - CRUD through the generic [`Repository`] contract
//! - Version-stamped updates (optimistic locking)
//! - Filtered, paginated listing built with [`QueryBuilder`]
//!
//! ## Listing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  UserFilter { email: "doe", status: Active }                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SELECT ... FROM users                                                 │
//! │   WHERE email LIKE ?1 ESCAPE '\'      ← "%doe%" (wildcards escaped)    │
//! │     AND status = ?2                   ← "active"                       │
//! │   ORDER BY created_at DESC, rowid DESC                                 │
//! │   LIMIT ?3 OFFSET ?4                                                   │
//! │                                                                         │
//! │  SQLite LIKE folds ASCII case only: "É" and "é" stay distinct.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use keystone_core::query::contains_pattern;
use keystone_core::{QueryBuilder, SortOrder, SqlValue, User, UserFilter};
use tracing::debug;

use super::{BaseRepository, Repository};
use crate::error::DbResult;
use crate::pool::Database;
use crate::txn::Scope;

const TABLE: &str = "users";

const COLUMNS: &str =
    "id, email, password_hash, first_name, last_name, status, created_at, updated_at, version";

/// Repository for user database operations.
///
/// ## Usage
/// ```rust,ignore
/// let repo = db.users();
/// let scope = Scope::new();
///
/// let mut user = User::new("jane@doe.com", hash, "Jane", "Doe");
/// repo.create(&scope, &user).await?;
///
/// user.first_name = "Janet".into();
/// user.bump_version();
/// repo.update(&scope, &user).await?;
/// ```
#[derive(Debug, Clone)]
pub struct UserRepository {
    base: BaseRepository<User, String>,
}

impl UserRepository {
    /// Creates a new UserRepository.
    pub fn new(db: Database) -> Self {
        UserRepository {
            base: BaseRepository::new(db, TABLE, "id"),
        }
    }

    /// Fetches a user by email (exact match).
    pub async fn get_by_email(&self, scope: &Scope, email: &str) -> DbResult<User> {
        let sql = format!("SELECT {COLUMNS} FROM {TABLE} WHERE email = ?1");
        self.base
            .fetch_one(scope, "get_by_email", &sql, vec![email.into()])
            .await
    }

    /// Looks a user up by id without failing when absent.
    pub async fn find_by_id(&self, scope: &Scope, id: &str) -> DbResult<Option<User>> {
        let sql = format!("SELECT {COLUMNS} FROM {TABLE} WHERE id = ?1");
        self.base
            .fetch_optional(scope, "find_by_id", &sql, vec![id.into()])
            .await
    }
}

/// Appends the filter's constraints: `WHERE` for the first, `AND` after.
fn apply_filter(mut qb: QueryBuilder, filter: &UserFilter) -> QueryBuilder {
    let mut conditions: Vec<(&str, SqlValue)> = Vec::new();

    let text_fields = [
        ("email LIKE ? ESCAPE '\\'", &filter.email),
        ("first_name LIKE ? ESCAPE '\\'", &filter.first_name),
        ("last_name LIKE ? ESCAPE '\\'", &filter.last_name),
    ];
    for (condition, value) in text_fields {
        if let Some(needle) = value.as_deref().filter(|v| !v.is_empty()) {
            conditions.push((condition, contains_pattern(needle).into()));
        }
    }
    if let Some(status) = filter.status {
        conditions.push(("status = ?", status.as_str().into()));
    }

    for (i, (condition, value)) in conditions.into_iter().enumerate() {
        qb = if i == 0 {
            qb.where_(condition, [value])
        } else {
            qb.and(condition, [value])
        };
    }
    qb
}

#[async_trait]
impl Repository<User, String> for UserRepository {
    type Filter = UserFilter;

    async fn create(&self, scope: &Scope, user: &User) -> DbResult<()> {
        debug!(id = %user.id, "Creating user");

        let sql = format!(
            "INSERT INTO {TABLE} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        );
        let args = vec![
            user.id.clone().into(),
            user.email.clone().into(),
            user.password_hash.clone().into(),
            user.first_name.clone().into(),
            user.last_name.clone().into(),
            user.status.as_str().into(),
            user.created_at.into(),
            user.updated_at.into(),
            user.version.into(),
        ];
        self.base.execute(scope, "create", &sql, args).await?;
        Ok(())
    }

    async fn get_by_id(&self, scope: &Scope, id: &String) -> DbResult<User> {
        let sql = format!("SELECT {COLUMNS} FROM {TABLE} WHERE id = ?1");
        self.base
            .fetch_one(scope, "get_by_id", &sql, vec![id.into()])
            .await
    }

    async fn update(&self, scope: &Scope, user: &User) -> DbResult<()> {
        debug!(id = %user.id, version = user.version, "Updating user");

        // ?8 is the new version; the row must still hold ?8 - 1.
        let sql = format!(
            "UPDATE {TABLE} SET \
                email = ?2, \
                password_hash = ?3, \
                first_name = ?4, \
                last_name = ?5, \
                status = ?6, \
                updated_at = ?7, \
                version = ?8 \
             WHERE id = ?1 AND version = ?8 - 1"
        );
        let args = vec![
            user.id.clone().into(),
            user.email.clone().into(),
            user.password_hash.clone().into(),
            user.first_name.clone().into(),
            user.last_name.clone().into(),
            user.status.as_str().into(),
            user.updated_at.into(),
            user.version.into(),
        ];
        self.base.update_versioned(scope, &user.id, &sql, args).await
    }

    async fn delete(&self, scope: &Scope, id: &String) -> DbResult<()> {
        debug!(id = %id, "Deleting user");
        self.base.delete_by_id(scope, id).await
    }

    async fn list(
        &self,
        scope: &Scope,
        filter: &UserFilter,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<User>> {
        let qb = apply_filter(QueryBuilder::new().select(COLUMNS).from(TABLE), filter);
        let (sql, args) = qb
            .order_by("created_at", SortOrder::Desc)
            .order_by("rowid", SortOrder::Desc)
            .limit(limit)
            .offset(offset)
            .build();

        let users = self.base.fetch_all(scope, "list", &sql, args).await?;
        debug!(count = users.len(), "Listed users");
        Ok(users)
    }

    async fn count(&self, scope: &Scope, filter: &UserFilter) -> DbResult<i64> {
        let (sql, args) = apply_filter(QueryBuilder::new().select("COUNT(*)").from(TABLE), filter).build();
        self.base.fetch_scalar(scope, "count", &sql, args).await
    }

    async fn exists(&self, scope: &Scope, id: &String) -> DbResult<bool> {
        self.base.exists_by_id(scope, id).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::test_support::TestDb;
    use keystone_core::{ErrorKind, ResponseClass, UserStatus, Versioned};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn user(email: &str, first: &str, last: &str) -> User {
        User::new(email, "hash", first, last)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        let jane = user("jane@doe.com", "Jane", "Doe");

        repo.create(&scope, &jane).await.unwrap();
        let stored = repo.get_by_id(&scope, &jane.id).await.unwrap();

        assert_eq!(stored.version, 1);
        assert_eq!(stored.email, "jane@doe.com");
        assert_eq!(stored.status, UserStatus::Active);
        assert_eq!(stored.created_at, jane.created_at);
        assert_eq!(repo.get_by_email(&scope, "jane@doe.com").await.unwrap().id, jane.id);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();

        let err = repo.get_by_id(&scope, &"missing".to_string()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(repo.find_by_id(&scope, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();

        repo.create(&scope, &user("jane@doe.com", "Jane", "Doe")).await.unwrap();
        let err = repo
            .create(&scope, &user("jane@doe.com", "Other", "Person"))
            .await
            .unwrap_err();

        assert!(err.is_duplicate_key());
        assert!(err.code().is_some());
        assert!(err.to_string().contains("email already exists"));
    }

    #[tokio::test]
    async fn test_duplicate_primary_key() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        let first = user("a@doe.com", "A", "A");
        let mut second = user("b@doe.com", "B", "B");
        second.id = first.id.clone();

        repo.create(&scope, &first).await.unwrap();
        let err = repo.create(&scope, &second).await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(err.to_string().contains("duplicate key violation"));
    }

    #[tokio::test]
    async fn test_check_constraint_is_invalid_input() {
        let t = TestDb::migrated().await;
        let scope = Scope::new();
        let base: BaseRepository<User, String> = BaseRepository::new(t.db.clone(), TABLE, "id");

        let sql = format!("INSERT INTO {TABLE} ({COLUMNS}) VALUES (?1, ?2, 'h', 'A', 'B', 'deleted', ?3, ?3, 1)");
        let now = chrono::Utc::now();
        let err = base
            .execute(&scope, "create", &sql, vec!["x".into(), "x@doe.com".into(), now.into()])
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn test_update_advances_version() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        let mut jane = user("jane@doe.com", "Jane", "Doe");
        repo.create(&scope, &jane).await.unwrap();

        jane.first_name = "Janet".into();
        jane.bump_version();
        repo.update(&scope, &jane).await.unwrap();

        let stored = repo.get_by_id(&scope, &jane.id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.first_name, "Janet");
        assert_eq!(stored.last_name, "Doe");
        assert_eq!(stored.email, jane.email);
        assert_eq!(stored.created_at, jane.created_at);
    }

    #[tokio::test]
    async fn test_stale_update_is_optimistic_lock() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        let mut jane = user("jane@doe.com", "Jane", "Doe");
        repo.create(&scope, &jane).await.unwrap();

        let mut stale = jane.clone();
        jane.bump_version();
        repo.update(&scope, &jane).await.unwrap();

        stale.last_name = "Smith".into();
        stale.bump_version();
        let err = repo.update(&scope, &stale).await.unwrap_err();
        assert!(err.is_optimistic_lock());
        assert_eq!(err.kind().response_class(), ResponseClass::VersionConflict);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let mut ghost = user("ghost@doe.com", "G", "H");
        ghost.bump_version();

        let err = repo.update(&Scope::new(), &ghost).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_exactly_one_wins() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let mut u1 = user("u1@doe.com", "U", "One");
        repo.create(&Scope::new(), &u1).await.unwrap();
        u1.bump_version();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let repo = repo.clone();
            let mut candidate = u1.clone();
            candidate.first_name = format!("Writer {i}");
            tasks.push(tokio::spawn(async move {
                repo.update(&Scope::new(), &candidate).await
            }));
        }

        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => wins += 1,
                Err(e) => assert!(e.is_optimistic_lock(), "unexpected error: {e}"),
            }
        }

        assert_eq!(wins, 1);
        let stored = repo.get_by_id(&Scope::new(), &u1.id).await.unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_transactions_lose_race_as_optimistic_lock() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let jane = user("jane@doe.com", "Jane", "Doe");
        repo.create(&Scope::new(), &jane).await.unwrap();

        // Both transactions read version 1 before either writes.
        let barrier = Arc::new(Barrier::new(2));
        let mut tasks = Vec::new();
        for i in 0..2 {
            let db = t.db.clone();
            let repo = repo.clone();
            let barrier = Arc::clone(&barrier);
            let id = jane.id.clone();
            tasks.push(tokio::spawn(async move {
                db.transactions()
                    .run_in_transaction(&Scope::new(), move |tx| async move {
                        let mut current = repo.get_by_id(&tx, &id).await?;
                        barrier.wait().await;
                        current.first_name = format!("Writer {i}");
                        current.bump_version();
                        repo.update(&tx, &current).await
                    })
                    .await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => wins += 1,
                Err(e) => {
                    assert!(e.is_optimistic_lock(), "unexpected error: {e}");
                    assert_eq!(e.kind().response_class(), ResponseClass::VersionConflict);
                    conflicts += 1;
                }
            }
        }

        assert_eq!((wins, conflicts), (1, 1));
        let stored = repo.get_by_id(&Scope::new(), &jane.id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.first_name.starts_with("Writer"));
    }

    #[tokio::test]
    async fn test_delete() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        let jane = user("jane@doe.com", "Jane", "Doe");
        repo.create(&scope, &jane).await.unwrap();

        repo.delete(&scope, &jane.id).await.unwrap();
        assert!(!repo.exists(&scope, &jane.id).await.unwrap());

        let err = repo.delete(&scope, &jane.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_email_substring() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        let alice = user("alice@doe.com", "Alice", "Doe");
        repo.create(&scope, &alice).await.unwrap();
        repo.create(&scope, &user("bob@example.com", "Bob", "Example")).await.unwrap();

        let found = repo.list(&scope, &UserFilter::email("doe"), 10, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, alice.id);

        let upper = repo.list(&scope, &UserFilter::email("DOE"), 10, 0).await.unwrap();
        assert_eq!(upper.len(), 1);
    }

    #[tokio::test]
    async fn test_list_escapes_wildcards() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        repo.create(&scope, &user("a_b@doe.com", "A", "B")).await.unwrap();
        repo.create(&scope, &user("axb@doe.com", "A", "X")).await.unwrap();

        let found = repo.list(&scope, &UserFilter::email("a_b"), 10, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "a_b@doe.com");

        assert_eq!(repo.count(&scope, &UserFilter::email("%")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_orders_newest_first_and_paginates() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();

        for i in 0..5 {
            repo.create(&scope, &user(&format!("user{i}@doe.com"), "U", "Ser")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let page = repo.list(&scope, &UserFilter::default(), 2, 1).await.unwrap();
        let emails: Vec<_> = page.iter().map(|u| u.email.as_str()).collect();
        assert_eq!(emails, vec!["user3@doe.com", "user2@doe.com"]);

        assert_eq!(repo.count(&scope, &UserFilter::default()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_list_passes_limit_and_offset_through() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();

        t.db.transactions()
            .run_in_transaction(&scope, |tx| {
                let repo = repo.clone();
                async move {
                    for i in 0..105 {
                        repo.create(&tx, &user(&format!("user{i}@doe.com"), "U", "Ser")).await?;
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        let all = UserFilter::default();
        assert_eq!(repo.list(&scope, &all, 150, 0).await.unwrap().len(), 105);
        assert!(repo.list(&scope, &all, 0, 0).await.unwrap().is_empty());
        assert_eq!(repo.list(&scope, &all, -1, 100).await.unwrap().len(), 5);
        assert_eq!(repo.count(&scope, &all).await.unwrap(), 105);
    }

    #[tokio::test]
    async fn test_name_filter_folds_ascii_case_only() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();
        let elodie = user("elodie@doe.com", "Élodie", "Durand");
        repo.create(&scope, &elodie).await.unwrap();

        let by_name = |name: &str| UserFilter {
            first_name: Some(name.into()),
            ..Default::default()
        };

        assert_eq!(repo.count(&scope, &by_name("Élodie")).await.unwrap(), 1);
        assert_eq!(repo.count(&scope, &by_name("LODIE")).await.unwrap(), 1);
        assert_eq!(repo.count(&scope, &by_name("élodie")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filters_combine_with_and() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        let scope = Scope::new();

        let mut suspended = user("sam@doe.com", "Sam", "Doe");
        suspended.status = UserStatus::Suspended;
        repo.create(&scope, &suspended).await.unwrap();
        repo.create(&scope, &user("sue@doe.com", "Sue", "Doe")).await.unwrap();

        let filter = UserFilter {
            last_name: Some("doe".into()),
            status: Some(UserStatus::Suspended),
            ..Default::default()
        };
        let found = repo.list(&scope, &filter, 10, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, suspended.id);
        assert_eq!(repo.count(&scope, &filter).await.unwrap(), 1);
    }

    #[test]
    fn test_apply_filter_sql() {
        let filter = UserFilter {
            email: Some("doe".into()),
            first_name: Some(String::new()),
            status: Some(UserStatus::Active),
            ..Default::default()
        };
        let (sql, args) = apply_filter(QueryBuilder::new().select("COUNT(*)").from(TABLE), &filter).build();
        assert_eq!(
            sql,
            "SELECT COUNT(*) FROM users WHERE email LIKE ?1 ESCAPE '\\' AND status = ?2"
        );
        assert_eq!(args, vec![SqlValue::from("%doe%"), SqlValue::from("active")]);
    }

    #[tokio::test]
    async fn test_closed_pool_is_connection_error() {
        let t = TestDb::migrated().await;
        let repo = t.db.users();
        t.db.close().await;

        let err = repo.count(&Scope::new(), &UserFilter::default()).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(matches!(err, DbError::Sql { .. }));
    }
}
