//! # Schema Migrations
//!
//! Versioned up/down SQL scripts with a recoverable dirty state.
//!
//! ## Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  MigrationManager   directory listing, validation, status, scaffolding │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  MigrationRunner    up / down / steps / migrate_to / force / version   │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  MigrationSource    complete pairs, ordered by version                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. `keystone-migrate create "add customer table"` writes the next pair
//! 2. Fill in both scripts; the down script must undo the up script
//! 3. **NEVER** modify a migration that has shipped; add a new one

pub mod manager;
pub mod runner;
pub mod source;

pub use manager::MigrationManager;
pub use runner::MigrationRunner;
pub use source::{Migration, MigrationSource};
