//! # Entity Types
//!
//! The entity contract the repository layer relies on, plus the `User`
//! example entity that exercises it end to end.
//!
//! ## Version Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  User::new(..)          version = 1    INSERT                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  user.bump_version()    version = 2    UPDATE ... WHERE version = 1     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  user.bump_version()    version = 3    UPDATE ... WHERE version = 2     │
//! │                                                                         │
//! │  The version is the only concurrency token. It never skips or repeats. │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Entity Contract
// =============================================================================

/// A record carrying an integer version for optimistic locking.
pub trait Versioned {
    /// The version as stored (or about to be stored).
    fn version(&self) -> i64;

    /// Overwrites the version.
    fn set_version(&mut self, version: i64);

    /// Advances the version by one, preparing the entity for an update.
    ///
    /// The repository writes the entity only if the stored row still holds
    /// `version() - 1`.
    fn bump_version(&mut self) {
        let next = self.version() + 1;
        self.set_version(next);
    }
}

/// A versioned record with a stable identifier.
pub trait Entity: Versioned {
    /// Identifier type (the primary key).
    type Id;

    /// Returns the identifier.
    fn id(&self) -> &Self::Id;
}

/// Version assigned to every freshly created entity.
pub const INITIAL_VERSION: i64 = 1;

// =============================================================================
// User Status
// =============================================================================

/// Account status of a [`User`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Inactive,
    Suspended,
}

impl UserStatus {
    /// The stored text value.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// User
// =============================================================================

/// A user account, the reference entity for the repository layer.
///
/// Hashing the password happens before the value reaches this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct User {
    /// Unique identifier (UUID v4, stored as text).
    pub id: String,

    /// Login email, unique across all users.
    pub email: String,

    /// Pre-computed password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,

    pub first_name: String,

    pub last_name: String,

    pub status: UserStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Optimistic-lock token.
    pub version: i64,
}

impl User {
    /// Builds a new active user with a fresh id and version 1.
    ///
    /// ## Arguments
    /// * `email` - Login email
    /// * `password_hash` - Already-hashed password
    /// * `first_name`, `last_name` - Display name parts
    pub fn new(
        email: impl Into<String>,
        password_hash: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        User {
            id: Uuid::new_v4().to_string(),
            email: email.into(),
            password_hash: password_hash.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            status: UserStatus::Active,
            created_at: now,
            updated_at: now,
            version: INITIAL_VERSION,
        }
    }

    /// "First Last", trimmed.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Whether the account may sign in.
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

impl Versioned for User {
    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

impl Entity for User {
    type Id = String;

    fn id(&self) -> &String {
        &self.id
    }
}

// =============================================================================
// User Filter
// =============================================================================

/// Optional constraints for listing and counting users.
///
/// Text fields match as case-insensitive substrings; `status` matches
/// exactly. Absent or empty fields are ignored and present ones are ANDed.
///
/// Case folding covers ASCII letters only (SQLite `LIKE` without ICU), so
/// `"doe"` finds `"DOE"` but `"élodie"` does not find `"Élodie"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserFilter {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: Option<UserStatus>,
}

impl UserFilter {
    /// Filter with only an email substring.
    pub fn email(needle: impl Into<String>) -> Self {
        UserFilter {
            email: Some(needle.into()),
            ..Default::default()
        }
    }

    /// Filter with only a status.
    pub fn status(status: UserStatus) -> Self {
        UserFilter {
            status: Some(status),
            ..Default::default()
        }
    }

    /// True when no field constrains the result.
    pub fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, str::is_empty);
        blank(&self.email)
            && blank(&self.first_name)
            && blank(&self.last_name)
            && self.status.is_none()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
