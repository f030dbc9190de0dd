//! # Database Error Types
//!
//! Error types for database operations and the translator that turns a
//! native sqlx error into one of them.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  translate(op, table, err) ← pure: no logging, no retry                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← op / table / vendor code / message / cause    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  .kind() → ErrorKind → .response_class() (in the handler layer)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Translation Rules (first match wins)
//! ```text
//! UNIQUE / PRIMARY KEY violation   → DuplicateKey
//! FOREIGN KEY violation            → ForeignKeyViolation
//! CHECK / NOT NULL violation       → InvalidInput
//! RowNotFound                      → NotFound
//! PoolTimedOut / PoolClosed / Io   → ConnectionFailed
//! anything else                    → Database
//! ```
//!
//! `SQLITE_BUSY` stays `Database` here. Only a versioned update inside a
//! transaction reclassifies it, as a lost optimistic-locking race.

use std::path::PathBuf;
use std::time::Duration;

use keystone_core::migration::Direction;
use keystone_core::ErrorKind;
use thiserror::Error;

use crate::config::ConfigError;

const SQLITE_BUSY: i32 = 5;
const SQLITE_READONLY: i32 = 8;

// =============================================================================
// Database Error
// =============================================================================

/// Transaction lifecycle stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Begin,
    Commit,
    Rollback,
}

impl std::fmt::Display for TxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStage::Begin => write!(f, "begin"),
            TxStage::Commit => write!(f, "commit"),
            TxStage::Rollback => write!(f, "rollback"),
        }
    }
}

/// Database operation errors.
///
/// Every variant answers [`DbError::kind`]; callers above the repository
/// layer should branch on that, not on the variant.
#[derive(Debug, Error)]
pub enum DbError {
    /// A statement failed and the native error was translated.
    ///
    /// ## When This Occurs
    /// - Constraint violations on insert/update
    /// - `fetch_one` found no row
    /// - Pool exhaustion or a closed pool during a repository call
    #[error("{op} {table}: {message}")]
    Sql {
        kind: ErrorKind,
        op: &'static str,
        table: String,
        /// Vendor error code (SQLite extended result code), when available.
        code: Option<String>,
        message: String,
        #[source]
        source: sqlx::Error,
    },

    /// A condition detected by the repository itself, with no native cause.
    ///
    /// ## When This Occurs
    /// - Zero rows affected by an update or delete
    /// - A version-stamped update lost the race
    #[error("{op} {table}: {kind}")]
    Kind {
        kind: ErrorKind,
        op: &'static str,
        table: String,
    },

    /// The pool could not be created or reached.
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Begin, commit, or rollback failed.
    #[error("Transaction {stage} failed: {source}")]
    Transaction {
        stage: TxStage,
        #[source]
        source: sqlx::Error,
    },

    /// The ambient transaction was already committed or rolled back.
    #[error("Transaction is no longer active")]
    TransactionClosed,

    /// A write was attempted inside a read-only transaction.
    #[error("{op} {table}: write rejected in read-only transaction")]
    ReadOnly { op: &'static str, table: String },

    /// The body failed and the rollback that followed failed too.
    ///
    /// `kind()` reports the kind of the original failure.
    #[error("{original} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        original: Box<DbError>,
        rollback: sqlx::Error,
    },

    /// The request scope was cancelled mid-flight.
    #[error("Operation cancelled")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Migration engine failure.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Invalid settings.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DbError {
    /// Returns the sentinel kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Sql { kind, .. } | DbError::Kind { kind, .. } => *kind,
            DbError::ConnectionFailed { .. } | DbError::Timeout(_) => ErrorKind::ConnectionFailed,
            DbError::Transaction { .. } | DbError::TransactionClosed | DbError::ReadOnly { .. } => {
                ErrorKind::TransactionFailed
            }
            DbError::RollbackFailed { original, .. } => original.kind(),
            DbError::Cancelled => ErrorKind::Cancelled,
            DbError::Migration(_) | DbError::Config(_) => ErrorKind::Database,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.kind() == ErrorKind::DuplicateKey
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.kind() == ErrorKind::ForeignKeyViolation
    }

    pub fn is_optimistic_lock(&self) -> bool {
        self.kind() == ErrorKind::OptimisticLock
    }

    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::ConnectionFailed
    }

    pub fn is_transaction_error(&self) -> bool {
        self.kind() == ErrorKind::TransactionFailed
    }

    pub fn is_invalid_input(&self) -> bool {
        self.kind() == ErrorKind::InvalidInput
    }

    /// Vendor error code, if the error came from the driver with one.
    pub fn code(&self) -> Option<&str> {
        match self {
            DbError::Sql { code, .. } => code.as_deref(),
            DbError::RollbackFailed { original, .. } => original.code(),
            _ => None,
        }
    }

    /// SQLite primary result code (the low byte of the extended code).
    fn primary_code(&self) -> Option<i32> {
        self.code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff)
    }

    /// SQLite refused a lock (`SQLITE_BUSY` and its extended codes).
    pub fn is_busy(&self) -> bool {
        self.primary_code() == Some(SQLITE_BUSY)
    }

    /// SQLite refused a write on a read-only connection (`SQLITE_READONLY`).
    pub(crate) fn is_read_only_violation(&self) -> bool {
        self.primary_code() == Some(SQLITE_READONLY)
    }

    /// Re-tags a translated error with another kind, keeping its cause.
    pub(crate) fn reclassify(self, kind: ErrorKind) -> Self {
        match self {
            DbError::Sql {
                op,
                table,
                code,
                source,
                ..
            } => DbError::Sql {
                kind,
                op,
                table,
                code,
                message: kind.to_string(),
                source,
            },
            other => other,
        }
    }

    /// Error for a repository-detected condition.
    pub(crate) fn kind_of(kind: ErrorKind, op: &'static str, table: impl Into<String>) -> Self {
        DbError::Kind {
            kind,
            op,
            table: table.into(),
        }
    }

    pub(crate) fn connection(message: impl Into<String>, source: Option<sqlx::Error>) -> Self {
        DbError::ConnectionFailed {
            message: message.into(),
            source,
        }
    }
}

// =============================================================================
// Translator
// =============================================================================

/// Translates a native sqlx error into a [`DbError`].
///
/// ## Arguments
/// * `op` - Operation name (`"create"`, `"update"`, ...)
/// * `table` - Table the operation targeted
/// * `err` - The native error
pub fn translate(op: &'static str, table: &str, err: sqlx::Error) -> DbError {
    let (kind, code, message) = match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned());
            let detail = db_err.message().to_string();
            match db_err.kind() {
                sqlx::error::ErrorKind::UniqueViolation => {
                    let mentions_email = detail.contains("email")
                        || db_err.constraint().is_some_and(|c| c.contains("email"));
                    let message = if mentions_email {
                        "email already exists".to_string()
                    } else {
                        ErrorKind::DuplicateKey.to_string()
                    };
                    (ErrorKind::DuplicateKey, code, message)
                }
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    (ErrorKind::ForeignKeyViolation, code, detail)
                }
                sqlx::error::ErrorKind::CheckViolation
                | sqlx::error::ErrorKind::NotNullViolation => (ErrorKind::InvalidInput, code, detail),
                _ => (ErrorKind::Database, code, detail),
            }
        }
        sqlx::Error::RowNotFound => (ErrorKind::NotFound, None, ErrorKind::NotFound.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            (ErrorKind::ConnectionFailed, None, err.to_string())
        }
        other => (ErrorKind::Database, None, other.to_string()),
    };

    DbError::Sql {
        kind,
        op,
        table: table.to_string(),
        code,
        message,
        source: err,
    }
}

// =============================================================================
// Migration Error
// =============================================================================

/// Migration engine failures.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The last attempt did not finish; only `force` may proceed.
    #[error("Dirty database version {version}. Fix and force version.")]
    Dirty { version: u32 },

    /// `steps(n)` asked for more migrations than exist in that direction.
    #[error("Cannot apply {requested} steps: only {available} available")]
    ShortLimit { requested: i64, available: usize },

    /// `force` or `migrate_to` named a version with no migration.
    #[error("Unknown migration version {0}")]
    UnknownVersion(u32),

    /// A version in 1..=max has no files at all.
    #[error("Migration version gap detected: missing version {expected}")]
    VersionGap { expected: u32 },

    /// One half of a pair is missing.
    #[error("{direction} migration file missing for version {version}")]
    MissingScript { version: u32, direction: Direction },

    /// A script is empty or holds only comments.
    #[error("{direction} migration file {file} appears to be empty or contains no SQL")]
    EmptyScript { file: String, direction: Direction },

    /// Two files claim the same version and direction.
    #[error("Duplicate {direction} migration for version {version}: {first} and {second}")]
    DuplicateVersion {
        version: u32,
        direction: Direction,
        first: String,
        second: String,
    },

    /// `create_migration` got an unusable name.
    #[error("Invalid migration name: {0}")]
    InvalidName(String),

    /// `create_migration` would overwrite an existing file.
    #[error("Migration file already exists: {0}")]
    AlreadyExists(String),

    /// A script failed; state is left dirty at `version`.
    #[error("Migration {version} ({direction}) failed: {source}")]
    ScriptFailed {
        version: u32,
        direction: Direction,
        #[source]
        source: sqlx::Error,
    },

    /// Reading or writing migration files failed.
    #[error("Migration file error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the `schema_migrations` table failed.
    #[error("Migration state error: {0}")]
    State(#[source] sqlx::Error),

    /// `schema_migrations` holds a version no migration can have.
    #[error("Migration state is corrupt: stored version {0} is out of range")]
    CorruptState(i64),
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Result type for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

// =============================================================================
// Unit Tests
// =============================================================================
