//! # Error Kinds
//!
//! Sentinel error kinds shared by every layer above the database.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  keystone-core (this file)                                             │
//! │  ├── ErrorKind       - Fixed, enumerable failure categories            │
//! │  └── ResponseClass   - How an outer surface should answer a kind       │
//! │                                                                         │
//! │  keystone-db (separate crate)                                          │
//! │  └── DbError         - Carries op/table/code context + a kind          │
//! │                                                                         │
//! │  Flow: sqlx::Error → translate() → DbError → .kind() → ResponseClass   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Callers above the repository layer branch on [`ErrorKind`] only,
//!    never on vendor error codes or message text
//! 2. Kinds are `Copy` so they can be compared freely
//! 3. Each kind maps to exactly one [`ResponseClass`]

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Sentinel failure category.
///
/// The `Display` text of each kind is stable and doubles as the default
/// human message when no richer context is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No row matched the requested identifier.
    #[error("entity not found")]
    NotFound,

    /// A uniqueness constraint was violated.
    #[error("duplicate key violation")]
    DuplicateKey,

    /// A referenced row does not exist.
    #[error("foreign key constraint violation")]
    ForeignKeyViolation,

    /// The row exists but another writer already advanced its version.
    ///
    /// ## When This Occurs
    /// ```text
    /// Writer A reads version=1 ──┐
    /// Writer B reads version=1 ──┤
    ///                            ├── A: UPDATE ... WHERE version = 1  ✓ (now 2)
    ///                            └── B: UPDATE ... WHERE version = 1  ✗ 0 rows
    ///                                   row still exists → OptimisticLock
    /// ```
    #[error("optimistic locking conflict")]
    OptimisticLock,

    /// A check or not-null constraint rejected the stored values.
    #[error("invalid input")]
    InvalidInput,

    /// The database could not be reached (pool timeout, closed pool, I/O).
    #[error("database connection failed")]
    ConnectionFailed,

    /// Begin, commit, or rollback failed, or the transaction was unusable.
    #[error("transaction failed")]
    TransactionFailed,

    /// The request scope was cancelled while a round trip was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Opaque infrastructure failure matching none of the kinds above.
    #[error("database error")]
    Database,
}

impl ErrorKind {
    /// Returns how an outer surface (HTTP, RPC) should answer this kind.
    ///
    /// ## Mapping
    /// ```text
    /// NotFound        → ResponseClass::NotFound
    /// DuplicateKey    → ResponseClass::Conflict
    /// OptimisticLock  → ResponseClass::VersionConflict
    /// everything else → ResponseClass::Internal
    /// ```
    pub fn response_class(self) -> ResponseClass {
        match self {
            ErrorKind::NotFound => ResponseClass::NotFound,
            ErrorKind::DuplicateKey => ResponseClass::Conflict,
            ErrorKind::OptimisticLock => ResponseClass::VersionConflict,
            _ => ResponseClass::Internal,
        }
    }

    /// Stable snake_case code, matching the serde representation.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicateKey => "duplicate_key",
            ErrorKind::ForeignKeyViolation => "foreign_key_violation",
            ErrorKind::OptimisticLock => "optimistic_lock",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::TransactionFailed => "transaction_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Database => "database",
        }
    }
}

// =============================================================================
// Response Class
// =============================================================================

/// The user-visible outcome an error kind must produce.
///
/// Producing the actual response belongs to the handler layer; this enum is
/// the contract it must honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseClass {
    /// 404-style answer.
    NotFound,
    /// 409-style answer for uniqueness conflicts.
    Conflict,
    /// 409-style answer for stale versions, distinct from [`ResponseClass::Conflict`].
    VersionConflict,
    /// 500-style answer.
    Internal,
}

impl ResponseClass {
    /// Conventional HTTP status code for this class.
    pub fn http_status(self) -> u16 {
        match self {
            ResponseClass::NotFound => 404,
            ResponseClass::Conflict | ResponseClass::VersionConflict => 409,
            ResponseClass::Internal => 500,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
