//! # Migration Tool
//!
//! Operator CLI over the migration manager.
//!
//! ## Usage
//! ```bash
//! # Apply everything pending
//! cargo run -p keystone-db --bin keystone-migrate -- up
//!
//! # Step back one migration
//! cargo run -p keystone-db --bin keystone-migrate -- steps -1
//!
//! # Recover from a failed migration
//! cargo run -p keystone-db --bin keystone-migrate -- force 3
//!
//! # Scaffold a new pair
//! cargo run -p keystone-db --bin keystone-migrate -- create "add orders table"
//!
//! # Explicit database and scripts
//! cargo run -p keystone-db --bin keystone-migrate -- --db ./data/app.db --dir ./migrations/sqlite status
//! ```
//!
//! Settings come from `keystone.toml` (or `--config PATH`) and `KEYSTONE_*`
//! environment variables; `--db` and `--dir` win over both.

use keystone_db::{MigrationManager, Settings};
use std::env;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Keystone Migration Tool

Usage: keystone-migrate [OPTIONS] <COMMAND>

Commands:
  up                 Apply all pending migrations
  down               Revert all applied migrations
  steps <N>          Apply N migrations (negative N reverts)
  to <VERSION>       Migrate up or down to VERSION
  force <VERSION>    Mark VERSION as applied and clean, running nothing
  version            Print the current version and dirty flag
  status             Print applied and pending migrations
  validate           Check the scripts directory for gaps and empty files
  create <NAME>      Write an empty up/down pair at the next version

Options:
  -d, --db <PATH>       Database file (default: from settings)
      --dir <PATH>      Migrations directory (default: from settings)
  -c, --config <PATH>   Settings file (default: ./keystone.toml)
  -h, --help            Show this help message";

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Up,
    Down,
    Steps(i64),
    To(u32),
    Force(u32),
    Version,
    Status,
    Validate,
    Create(String),
}

#[derive(Debug, Default)]
struct Args {
    db: Option<PathBuf>,
    dir: Option<PathBuf>,
    config: Option<PathBuf>,
    help: bool,
    positional: Vec<String>,
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let mut args = Args::default();

    let mut i = 0;
    while i < raw.len() {
        let flag = raw[i].as_str();
        let mut value = || {
            i += 1;
            raw.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };

        match flag {
            "--db" | "-d" => args.db = Some(PathBuf::from(value()?)),
            "--dir" => args.dir = Some(PathBuf::from(value()?)),
            "--config" | "-c" => args.config = Some(PathBuf::from(value()?)),
            "--help" | "-h" => args.help = true,
            _ => args.positional.push(flag.to_string()),
        }
        i += 1;
    }

    Ok(args)
}

fn parse_command(positional: &[String]) -> Result<Command, String> {
    let (name, rest) = positional
        .split_first()
        .ok_or_else(|| "missing command".to_string())?;

    let number = |what: &str| -> Result<String, String> {
        match rest {
            [value] => Ok(value.clone()),
            _ => Err(format!("{name} takes exactly one {what}")),
        }
    };

    let command = match name.as_str() {
        "up" => Command::Up,
        "down" => Command::Down,
        "version" => Command::Version,
        "status" => Command::Status,
        "validate" => Command::Validate,
        "steps" => {
            let n = number("step count")?;
            Command::Steps(n.parse().map_err(|_| format!("invalid step count: {n}"))?)
        }
        "to" => {
            let v = number("version")?;
            Command::To(v.parse().map_err(|_| format!("invalid version: {v}"))?)
        }
        "force" => {
            let v = number("version")?;
            Command::Force(v.parse().map_err(|_| format!("invalid version: {v}"))?)
        }
        "create" => {
            if rest.is_empty() {
                return Err("create requires a migration name".to_string());
            }
            Command::Create(rest.join(" "))
        }
        other => return Err(format!("unknown command: {other}")),
    };

    let takes_args = matches!(
        command,
        Command::Steps(_) | Command::To(_) | Command::Force(_) | Command::Create(_)
    );
    if !takes_args && !rest.is_empty() {
        return Err(format!("{name} takes no arguments"));
    }

    Ok(command)
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},sqlx=warn")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let raw: Vec<String> = env::args().skip(1).collect();

    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    if args.help {
        println!("{USAGE}");
        return;
    }
    let command = match parse_command(&args.positional) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    let mut settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(db) = args.db {
        settings.database.path = db;
    }
    if let Some(dir) = args.dir {
        settings.migrations.dir = dir;
    }

    init_tracing(&settings.log_level);
    debug!(?command, path = %settings.database.path.display(), "Starting migration tool");

    if let Err(e) = run(&settings, command).await {
        error!(error = %e, "Migration command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(settings: &Settings, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    // A fresh project has no scripts directory yet
    if matches!(command, Command::Create(_)) {
        std::fs::create_dir_all(&settings.migrations.dir)?;
    }

    let mut manager = MigrationManager::new(&settings.db_config(), &settings.migrations.dir).await?;
    let result = execute(&mut manager, command).await;
    manager.close().await?;
    result
}

async fn execute(
    manager: &mut MigrationManager,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Up => {
            let applied = manager.migrate_up().await?;
            println!("✓ Applied {applied} migration(s)");
        }
        Command::Down => {
            let reverted = manager.migrate_down().await?;
            println!("✓ Reverted {reverted} migration(s)");
        }
        Command::Steps(n) => {
            let ran = manager.migrate_steps(n).await?;
            println!("✓ Ran {ran} migration(s)");
        }
        Command::To(version) => {
            let ran = manager.migrate_to(version).await?;
            println!("✓ Ran {ran} migration(s) to reach version {version}");
        }
        Command::Force(version) => {
            manager.force(version).await?;
            println!("✓ Forced version {version}");
        }
        Command::Version => {
            let (version, dirty) = manager.version().await?;
            println!("Version: {version} (dirty: {dirty})");
        }
        Command::Status => {
            let status = manager.status().await?;
            println!("{status}");
            println!();
            for m in &status.applied_migrations {
                println!("  [x] {:03} {}", m.version, m.name);
            }
            for m in &status.pending_migrations {
                println!("  [ ] {:03} {}", m.version, m.name);
            }
        }
        Command::Validate => {
            manager.validate_migrations()?;
            let count = manager.list_migrations()?.len();
            println!("✓ {count} migration(s) valid in {}", manager.dir().display());
        }
        Command::Create(name) => {
            let info = manager.create_migration(&name)?;
            for file in [&info.up_file, &info.down_file].into_iter().flatten() {
                println!("✓ Created {}", manager.dir().join(file).display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_flags_and_command() {
        let args = parse_args(&strings(&["--db", "app.db", "steps", "-1", "--dir", "m"])).unwrap();
        assert_eq!(args.db, Some(PathBuf::from("app.db")));
        assert_eq!(args.dir, Some(PathBuf::from("m")));
        assert_eq!(parse_command(&args.positional).unwrap(), Command::Steps(-1));
    }

    #[test]
    fn test_create_joins_name_words() {
        let args = parse_args(&strings(&["create", "add", "orders", "table"])).unwrap();
        assert_eq!(
            parse_command(&args.positional).unwrap(),
            Command::Create("add orders table".to_string())
        );
    }

    #[test]
    fn test_bad_input_is_rejected() {
        assert!(parse_args(&strings(&["--db"])).is_err());
        assert!(parse_command(&strings(&[])).is_err());
        assert!(parse_command(&strings(&["to", "x"])).is_err());
        assert!(parse_command(&strings(&["force"])).is_err());
        assert!(parse_command(&strings(&["up", "extra"])).is_err());
        assert!(parse_command(&strings(&["rewind"])).is_err());
    }
}
