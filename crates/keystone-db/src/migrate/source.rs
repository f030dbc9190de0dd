//! Migration discovery and the ordered script set the runner executes.

use keystone_core::migration::{parse_file_name, Direction, MigrationInfo};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{MigrationError, MigrationResult};

/// One complete up/down pair, loaded into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub up_sql: String,
    pub down_sql: String,
}

impl Migration {
    pub fn new(
        version: u32,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        Migration {
            version,
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
        }
    }

    pub fn script(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up_sql,
            Direction::Down => &self.down_sql,
        }
    }
}

/// Scans `dir` for script files and groups them by version.
///
/// Incomplete pairs are kept so validation can report them. Files that do
/// not follow the `NNN_name.{up,down}.sql` pattern are ignored.
///
/// ## Returns
/// * `Err(MigrationError::Io)` - The directory cannot be read
/// * `Err(MigrationError::DuplicateVersion)` - Two files share a version and direction
pub(crate) fn discover(dir: &Path) -> MigrationResult<BTreeMap<u32, MigrationInfo>> {
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;

    let mut found: BTreeMap<u32, MigrationInfo> = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let is_file = entry
            .file_type()
            .map_err(|source| io_error(&entry.path(), source))?
            .is_file();
        if !is_file {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(script) = parse_file_name(&file_name) else {
            continue;
        };

        let info = found.entry(script.version).or_insert_with(|| {
            let mut info = MigrationInfo::new(script.version);
            info.name = script.name.clone();
            info.description = script.name.replace('_', " ");
            info
        });

        let slot = match script.direction {
            Direction::Up => &mut info.up_file,
            Direction::Down => &mut info.down_file,
        };
        if let Some(existing) = slot.as_ref() {
            // read_dir order is unspecified; report the pair sorted
            let (first, second) = if *existing <= file_name {
                (existing.clone(), file_name)
            } else {
                (file_name, existing.clone())
            };
            return Err(MigrationError::DuplicateVersion {
                version: script.version,
                direction: script.direction,
                first,
                second,
            });
        }
        *slot = Some(file_name);
    }

    Ok(found)
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> MigrationError {
    MigrationError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Ordered set of complete migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationSource {
    migrations: Vec<Migration>,
}

impl MigrationSource {
    /// Builds a source from in-memory migrations, sorted by version.
    ///
    /// A later entry replaces an earlier one with the same version.
    pub fn from_migrations(migrations: Vec<Migration>) -> Self {
        let by_version: BTreeMap<u32, Migration> =
            migrations.into_iter().map(|m| (m.version, m)).collect();
        MigrationSource {
            migrations: by_version.into_values().collect(),
        }
    }

    /// Loads every complete pair from `dir`. Incomplete pairs are skipped.
    pub fn from_dir(dir: impl AsRef<Path>) -> MigrationResult<Self> {
        let dir = dir.as_ref();
        let mut migrations = Vec::new();

        for info in discover(dir)?.into_values() {
            let (Some(up_file), Some(down_file)) = (&info.up_file, &info.down_file) else {
                continue;
            };
            migrations.push(Migration {
                version: info.version,
                up_sql: read_script(&dir.join(up_file))?,
                down_sql: read_script(&dir.join(down_file))?,
                name: info.name,
            });
        }

        Ok(MigrationSource { migrations })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Highest known version, 0 when empty.
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    pub fn get(&self, version: u32) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|i| &self.migrations[i])
    }

    /// 0 (nothing applied) or the version of a known migration.
    pub fn is_known(&self, version: u32) -> bool {
        version == 0 || self.get(version).is_some()
    }

    /// Migrations above `current`, ascending.
    pub(crate) fn pending(&self, current: u32) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(move |m| m.version > current)
    }

    /// Migrations at or below `current`, descending.
    pub(crate) fn applied(&self, current: u32) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().rev().filter(move |m| m.version <= current)
    }

    /// The version that precedes `version`, or 0 for the first migration.
    pub(crate) fn previous_version(&self, version: u32) -> u32 {
        self.migrations
            .iter()
            .rev()
            .map(|m| m.version)
            .find(|v| *v < version)
            .unwrap_or(0)
    }
}

fn read_script(path: &Path) -> MigrationResult<String> {
    fs::read_to_string(path).map_err(|source| io_error(path, source))
}

// =============================================================================
// Unit Tests
// =============================================================================
