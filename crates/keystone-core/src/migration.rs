//! # Migration Naming and Status
//!
//! The pure half of the migration engine: file-name grammar, script
//! content checks, templates, and the status report. Reading directories
//! and running scripts lives in `keystone-db`.
//!
//! ## File Layout
//! ```text
//! migrations/sqlite/
//! ├── 001_create_users_table.up.sql     ← version 1, forward
//! ├── 001_create_users_table.down.sql   ← version 1, reverse
//! ├── 002_add_user_roles.up.sql
//! └── 002_add_user_roles.down.sql
//!
//!  {version:03}_{name}.{up|down}.sql
//!  A version is usable only when both halves exist.
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Direction
// =============================================================================

/// Which half of a migration pair a script belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// File suffix including the `.sql` extension.
    pub fn suffix(&self) -> &'static str {
        match self {
            Direction::Up => ".up.sql",
            Direction::Down => ".down.sql",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

// =============================================================================
// File Names
// =============================================================================

/// A successfully parsed script file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName {
    pub version: u32,
    pub name: String,
    pub direction: Direction,
}

/// Parses `{version}_{name}.{up|down}.sql`.
///
/// Returns `None` for anything that doesn't follow the grammar (README
/// files, editor backups, a non-numeric prefix).
///
/// ## Example
/// ```rust
/// use keystone_core::migration::{parse_file_name, Direction};
///
/// let script = parse_file_name("003_add_col.up.sql").unwrap();
/// assert_eq!(script.version, 3);
/// assert_eq!(script.name, "add_col");
/// assert_eq!(script.direction, Direction::Up);
///
/// assert!(parse_file_name("notes.txt").is_none());
/// ```
pub fn parse_file_name(file_name: &str) -> Option<ScriptName> {
    let (stem, direction) = if let Some(stem) = file_name.strip_suffix(Direction::Up.suffix()) {
        (stem, Direction::Up)
    } else if let Some(stem) = file_name.strip_suffix(Direction::Down.suffix()) {
        (stem, Direction::Down)
    } else {
        return None;
    };

    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version: u32 = version.parse().ok()?;

    Some(ScriptName {
        version,
        name: name.to_string(),
        direction,
    })
}

/// Formats a script file name with a zero-padded version.
///
/// ```rust
/// use keystone_core::migration::{file_name, Direction};
///
/// assert_eq!(file_name(7, "add_index", Direction::Down), "007_add_index.down.sql");
/// ```
pub fn file_name(version: u32, name: &str, direction: Direction) -> String {
    format!("{version:03}_{name}{}", direction.suffix())
}

/// Normalizes a human migration name: lowercase, spaces and hyphens to `_`.
pub fn clean_name(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '-'], "_")
}

/// True if the script has at least one line that is neither blank nor a
/// `--` comment.
pub fn contains_sql(content: &str) -> bool {
    content.lines().map(str::trim).any(|line| !line.is_empty() && !line.starts_with("--"))
}

/// Template written into a freshly created script.
///
/// ## Arguments
/// * `description` - The name as the operator typed it
/// * `created` - Timestamp text, `YYYY-MM-DD HH:MM:SS`
pub fn script_template(direction: Direction, description: &str, created: &str) -> String {
    match direction {
        Direction::Up => format!(
            "-- Migration: {description}\n\
             -- Created: {created}\n\
             -- Description: {description}\n\
             \n\
             -- Add your up migration SQL here\n\n"
        ),
        Direction::Down => format!(
            "-- Migration rollback: {description}\n\
             -- Created: {created}\n\
             -- Description: Rollback for {description}\n\
             \n\
             -- Add your down migration SQL here\n\n"
        ),
    }
}

// =============================================================================
// Migration Info
// =============================================================================

/// One discovered migration pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: u32,
    pub name: String,
    pub up_file: Option<String>,
    pub down_file: Option<String>,
    /// Free-form description (the original name for created migrations).
    pub description: String,
}

impl MigrationInfo {
    /// Creates an entry with neither script recorded yet.
    pub fn new(version: u32) -> Self {
        MigrationInfo {
            version,
            name: String::new(),
            up_file: None,
            down_file: None,
            description: String::new(),
        }
    }

    /// Both halves are present.
    pub fn is_complete(&self) -> bool {
        self.up_file.is_some() && self.down_file.is_some()
    }

    /// Script file name for one direction, if present.
    pub fn file(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Up => self.up_file.as_deref(),
            Direction::Down => self.down_file.as_deref(),
        }
    }
}

// =============================================================================
// Migration Status
// =============================================================================

/// Snapshot of applied vs. pending migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub latest_version: u32,
    pub is_dirty: bool,
    pub applied_migrations: Vec<MigrationInfo>,
    pub pending_migrations: Vec<MigrationInfo>,
    pub total_migrations: usize,
    pub applied_count: usize,
    pub pending_count: usize,
}

impl MigrationStatus {
    /// Splits the sorted list of complete migrations around `current_version`.
    pub fn new(current_version: u32, is_dirty: bool, migrations: Vec<MigrationInfo>) -> Self {
        let latest_version = migrations.last().map_or(0, |m| m.version);
        let total_migrations = migrations.len();
        let (applied_migrations, pending_migrations): (Vec<_>, Vec<_>) = migrations
            .into_iter()
            .partition(|m| m.version <= current_version);

        MigrationStatus {
            current_version,
            latest_version,
            is_dirty,
            applied_count: applied_migrations.len(),
            pending_count: pending_migrations.len(),
            applied_migrations,
            pending_migrations,
            total_migrations,
        }
    }

    /// At the latest version and clean.
    pub fn is_up_to_date(&self) -> bool {
        self.current_version == self.latest_version && !self.is_dirty
    }

    /// Pending migrations exist or the state is dirty.
    pub fn needs_migration(&self) -> bool {
        self.pending_count > 0 || self.is_dirty
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dirty {
            return write!(f, "Migration state is dirty at version {}", self.current_version);
        }
        if self.is_up_to_date() {
            return write!(f, "All migrations applied (version {})", self.current_version);
        }
        write!(
            f,
            "Migration needed: {}/{} applied (current: {}, latest: {})",
            self.applied_count, self.total_migrations, self.current_version, self.latest_version
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
