//! # keystone-core: Pure Data-Access Vocabulary
//!
//! The types every layer above the database shares, with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Keystone Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Handlers (HTTP / RPC, outside this workspace)        │   │
//! │  │     branch on ErrorKind::response_class(), never on SQL codes   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ keystone-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐   │   │
//! │  │   │   error   │  │   query   │  │   types   │  │ migration │   │   │
//! │  │   │ ErrorKind │  │  Query    │  │   User    │  │ file names│   │   │
//! │  │   │ Response  │  │  Builder  │  │ Versioned │  │  status   │   │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 keystone-db (Database Layer)                    │   │
//! │  │   pool, transactions, repositories, migration runner            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Sentinel error kinds and the response contract
//! - [`query`] - Fluent SQL builder with `?N` placeholders
//! - [`types`] - Entity contract (`Versioned`, `Entity`) and `User`
//! - [`migration`] - Migration file-name grammar and status report
//!
//! ## Example Usage
//!
//! ```rust
//! use keystone_core::{ErrorKind, QueryBuilder, ResponseClass, SortOrder};
//!
//! let (sql, args) = QueryBuilder::new()
//!     .select("*")
//!     .from("users")
//!     .where_("status = ?", ["active"])
//!     .order_by("created_at", SortOrder::Desc)
//!     .build();
//!
//! assert_eq!(sql, "SELECT * FROM users WHERE status = ?1 ORDER BY created_at DESC");
//! assert_eq!(args.len(), 1);
//!
//! assert_eq!(ErrorKind::OptimisticLock.response_class(), ResponseClass::VersionConflict);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migration;
pub mod query;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{ErrorKind, ResponseClass};
pub use migration::{Direction, MigrationInfo, MigrationStatus};
pub use query::{QueryBuilder, SortOrder, SqlValue};
pub use types::*;
