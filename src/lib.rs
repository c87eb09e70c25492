//! # sqlite-rw - Read/Write Splitting for SQLite
//!
//! SQLite gives you one file and one writer lock. sqlite-rw splits a database
//! into two files:
//!
//! - a **primary** that takes every write
//! - a **replica** that serves reads without touching the primary's lock
//!
//! SQLite has no replication of its own, so the crate carries one: every
//! mutation appends a record to a change log (`binlog`) inside the same
//! transaction, and a background worker replays the log onto the replica.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Table / AsyncTable                          │
//! │              insert · update · delete · select                  │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │ writes                          │ reads
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐     ┌───────────────────────────┐
//! │ BEGIN IMMEDIATE               │     │        ReadRouter         │
//! │   mutate + append to binlog   │     │  replica (default) or     │
//! │ COMMIT ──► scheduler.enqueue  │     │  primary (read-your-write)│
//! └───────────────┬───────────────┘     └─────────────┬─────────────┘
//!                 ▼                                   │
//! ┌───────────────────────────────┐                   │
//! │  Scheduler (one worker)       │                   │
//! │  bounded queue, periodic retry│                   │
//! └───────────────┬───────────────┘                   │
//!                 ▼                                   │
//! ┌───────────────────────────────┐                   │
//! │  Replicator                   │                   │
//! │  binlog batch ──► replica     │                   │
//! └───────┬───────────────┬───────┘                   │
//!         ▼               ▼                           │
//!    ┌─────────┐     ┌─────────┐                      │
//!    │ write.db│     │ read.db │ ◄────────────────────┘
//!    └─────────┘     └─────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **No orphans**: a change-log record exists iff its mutation committed
//! 2. **Ordered replay**: records are applied in ascending id order
//! 3. **Apply then remove**: a record leaves the log only after it was applied
//! 4. **Idempotent replay**: re-applying a record leaves the replica unchanged
//! 5. **Nothing dropped**: a full scheduler queue runs work inline instead
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlite_rw::{Filter, PrimaryKey, Row, RwDatabase, Scheduler, SchedulerConfig, StoreConfig};
//!
//! let scheduler = Scheduler::start(SchedulerConfig::default())?;
//! let db = RwDatabase::open(StoreConfig::new("write.db", "read.db"), &scheduler.handle())?;
//!
//! let manager = db.table_manager("user");
//! manager.ensure_table(&PrimaryKey::AutoIncrement)?;
//! manager.ensure_column("name", "TEXT", None, false)?;
//!
//! let users = db.table("user");
//! users.insert(Row::new().with("name", "a"))?;
//! db.sync_now()?;
//! assert_eq!(users.count(Filter::All)?, 1);
//!
//! scheduler.shutdown();
//! # Ok::<(), sqlite_rw::Error>(())
//! ```
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum with retryable/fatal classification
//! - [`config`]: Serde-backed configuration with defaults
//! - [`types`]: `Value`, `Row`, `Filter`, `Select`
//! - [`store`]: Pooled connections and SQL helpers
//! - [`schema`]: Idempotent DDL on both stores
//! - [`changelog`]: The `binlog` table
//! - [`scheduler`]: Background worker
//! - [`replicator`]: Change-log replay
//! - [`router`]: Read routing
//! - [`table`]: Writes and reads for one table
//! - [`database`]: One primary/replica pair
//! - [`api`]: Async facade

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for sqlite-rw operations.
pub mod error;

/// Configuration structs, loadable from JSON.
pub mod config;

/// Values, rows and query descriptions.
///
/// Rows are schema-less ordered maps; the same shape is used for input,
/// query results and change-log payloads.
pub mod types;

/// SQLite stores with pooled connections.
pub mod store;

/// Idempotent DDL applied to primary and replica together, plus the crate's
/// metadata table.
pub mod schema;

/// The append-only change log kept on the primary.
pub mod changelog;

/// Single-threaded background worker with back-pressure.
///
/// Runs replication passes queued by writes and, when idle, the periodic
/// retry registered for each primary.
pub mod scheduler;

/// Replays change-log records onto the replica.
pub mod replicator;

/// Chooses the store that serves a read.
pub mod router;

/// Write gateway and reads for one table.
pub mod table;

/// Opens a primary/replica pair and hands out tables.
pub mod database;

/// Async facade over [`Table`] for Tokio applications.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::AsyncTable;
pub use changelog::{ChangeLogEntry, OpType, Operation, CHANGELOG_TABLE};
pub use config::{Config, JournalMode, SchedulerConfig, StoreConfig};
pub use database::RwDatabase;
pub use error::{Error, Result};
pub use replicator::{PassReport, ReplicationLock, Replicator};
pub use router::{ReadRouter, ReadTarget};
pub use scheduler::{Dispatch, PeriodicRegistration, Scheduler, SchedulerHandle};
pub use schema::{ColumnInfo, PrimaryKey, TableManager};
pub use store::{ConnectionOptions, Store};
pub use table::Table;
pub use types::{Filter, Row, Select, Value};
