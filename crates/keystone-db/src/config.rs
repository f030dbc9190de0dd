//! # Configuration
//!
//! Settings for the database layer and the migration binary.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     KEYSTONE_DATABASE_PATH=/var/lib/keystone/app.db                    │
//! │     KEYSTONE_MAX_CONNECTIONS=10                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     keystone.toml (or the path given on the command line)              │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     25 connections, 5 min lifetime, migrations/sqlite                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! log_level = "info"
//!
//! [database]
//! path = "keystone.db"
//! max_connections = 25
//! min_connections = 5
//! connect_timeout_secs = 30
//! max_lifetime_secs = 300
//! max_idle_time_secs = 300
//!
//! [migrations]
//! dir = "migrations/sqlite"
//! run_on_startup = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::pool::DbConfig;

// =============================================================================
// Config Error
// =============================================================================

/// Failures while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Database Settings
// =============================================================================

/// `[database]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path. `:memory:` selects an in-memory database.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connections kept open while idle.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum connection age. `0` disables the limit.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,

    /// Maximum time a connection may sit idle. `0` disables the limit.
    #[serde(default = "default_max_idle_time")]
    pub max_idle_time_secs: u64,
}

fn default_path() -> PathBuf {
    PathBuf::from("keystone.db")
}

fn default_max_connections() -> u32 {
    25
}

fn default_min_connections() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_lifetime() -> u64 {
    300
}

fn default_max_idle_time() -> u64 {
    300
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_path(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            max_lifetime_secs: default_max_lifetime(),
            max_idle_time_secs: default_max_idle_time(),
        }
    }
}

// =============================================================================
// Migration Settings
// =============================================================================

/// `[migrations]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSettings {
    /// Directory holding the `NNN_name.{up,down}.sql` pairs.
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,

    /// Apply pending migrations when the database manager initializes.
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations/sqlite")
}

fn default_true() -> bool {
    true
}

impl Default for MigrationSettings {
    fn default() -> Self {
        MigrationSettings {
            dir: default_migrations_dir(),
            run_on_startup: true,
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub migrations: MigrationSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: default_log_level(),
            database: DatabaseSettings::default(),
            migrations: MigrationSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings: defaults, then the TOML file (if it exists), then
    /// `KEYSTONE_*` environment overrides, then validation.
    ///
    /// ## Arguments
    /// * `config_path` - Explicit file; `None` tries `./keystone.toml`
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("keystone.toml"));

        let mut settings = if path.exists() {
            info!(?path, "Loading settings from file");
            Self::from_file(&path)?
        } else {
            debug!(?path, "Config file not found, using defaults");
            Self::default()
        };

        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parses a TOML file without applying overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Applies overrides from a key lookup (the environment in production).
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("KEYSTONE_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }
        if let Some(n) = lookup("KEYSTONE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.database.max_connections = n;
        }
        if let Some(n) = lookup("KEYSTONE_MIN_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.database.min_connections = n;
        }
        if let Some(n) = lookup("KEYSTONE_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.database.connect_timeout_secs = n;
        }
        if let Some(n) = lookup("KEYSTONE_MAX_LIFETIME_SECS").and_then(|v| v.parse().ok()) {
            self.database.max_lifetime_secs = n;
        }
        if let Some(n) = lookup("KEYSTONE_MAX_IDLE_TIME_SECS").and_then(|v| v.parse().ok()) {
            self.database.max_idle_time_secs = n;
        }
        if let Some(dir) = lookup("KEYSTONE_MIGRATIONS_DIR") {
            self.migrations.dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("KEYSTONE_RUN_MIGRATIONS") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.migrations.run_on_startup = true,
                "0" | "false" | "no" => self.migrations.run_on_startup = false,
                _ => {}
            }
        }
        if let Some(level) = lookup("KEYSTONE_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be greater than 0".into(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Invalid(format!(
                "database.min_connections ({}) exceeds max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.database.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "database.connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid("log_level must not be empty".into()));
        }
        Ok(())
    }

    /// Builds the pool configuration.
    pub fn db_config(&self) -> DbConfig {
        let db = &self.database;
        let limit = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        DbConfig::new(&db.path)
            .max_connections(db.max_connections)
            .min_connections(db.min_connections)
            .connect_timeout(Duration::from_secs(db.connect_timeout_secs))
            .max_lifetime(limit(db.max_lifetime_secs))
            .max_idle_time(limit(db.max_idle_time_secs))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.database.max_connections, 25);
        assert_eq!(settings.database.min_connections, 5);
        assert_eq!(settings.migrations.dir, PathBuf::from("migrations/sqlite"));
        assert!(settings.validate().is_ok());

        let config = settings.db_config();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(300)));
        assert_eq!(config.max_idle_time, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystone.toml");
        std::fs::write(
            &path,
            "log_level = \"debug\"\n[database]\npath = \"app.db\"\nmax_lifetime_secs = 0\n",
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.database.path, PathBuf::from("app.db"));
        assert_eq!(settings.database.max_connections, 25);
        assert!(settings.migrations.run_on_startup);
        assert_eq!(settings.db_config().max_lifetime, None);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("KEYSTONE_DATABASE_PATH", "/tmp/other.db"),
            ("KEYSTONE_MAX_CONNECTIONS", "8"),
            ("KEYSTONE_MIN_CONNECTIONS", "not-a-number"),
            ("KEYSTONE_RUN_MIGRATIONS", "false"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.database.path, PathBuf::from("/tmp/other.db"));
        assert_eq!(settings.database.max_connections, 8);
        assert_eq!(settings.database.min_connections, 5);
        assert!(!settings.migrations.run_on_startup);
    }

    #[test]
    fn test_validation_rejects_min_above_max() {
        let mut settings = Settings::default();
        settings.database.max_connections = 2;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[database\n").unwrap();
        assert!(matches!(Settings::from_file(&path), Err(ConfigError::Parse(_))));
    }
}
