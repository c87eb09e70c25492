//! # Configuration
//!
//! Two independent sections:
//!
//! - [`SchedulerConfig`]: the background worker (one per process)
//! - [`StoreConfig`]: one primary/replica pair and how it is accessed
//!
//! Both deserialize from JSON with a default for every optional field, so a
//! minimal store entry only names its two files:
//!
//! ```rust
//! use sqlite_rw::Config;
//!
//! let config = Config::from_json_str(r#"{
//!     "stores": [
//!         { "primary_path": "data/write.db", "replica_path": "data/read.db" }
//!     ]
//! }"#)?;
//! assert_eq!(config.scheduler.queue_capacity, 200);
//! assert_eq!(config.stores[0].batch_size, 10);
//! # Ok::<(), sqlite_rw::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::router::ReadTarget;

// =============================================================================
// Defaults
// =============================================================================

/// Tasks the scheduler queues before enqueueing turns synchronous.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// Idle time after which periodic tasks fire.
pub const DEFAULT_CRON_INTERVAL_MS: u64 = 5_000;

/// Sleep between queue polls while idle.
pub const DEFAULT_IDLE_POLL_MS: u64 = 10;

/// Lock wait for caller-facing reads and writes.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Lock wait for replication connections. Kept short so replication gives
/// way to a contended primary.
pub const DEFAULT_REPLICATION_TIMEOUT_MS: u64 = 1_000;

/// Change-log entries applied per replication pass.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Idle connections kept per store.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 8;

const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

const fn default_cron_interval_ms() -> u64 {
    DEFAULT_CRON_INTERVAL_MS
}

const fn default_idle_poll_ms() -> u64 {
    DEFAULT_IDLE_POLL_MS
}

const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

const fn default_replication_timeout_ms() -> u64 {
    DEFAULT_REPLICATION_TIMEOUT_MS
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_max_idle_connections() -> usize {
    DEFAULT_MAX_IDLE_CONNECTIONS
}

// =============================================================================
// Journal Mode
// =============================================================================

/// SQLite journal mode applied to every connection.
///
/// `Wal` lets readers proceed while a writer holds the lock. `Delete` is
/// SQLite's rollback journal, where a long read transaction blocks writers
/// until their busy timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
        }
    }
}

// =============================================================================
// Scheduler Configuration
// =============================================================================

/// Configuration for the background [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Queue length at which `enqueue` runs the task inline instead.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Idle time (milliseconds) before periodic tasks are enqueued.
    #[serde(default = "default_cron_interval_ms")]
    pub cron_interval_ms: u64,

    /// Sleep (milliseconds) between polls of an empty queue.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cron_interval_ms: DEFAULT_CRON_INTERVAL_MS,
            idle_poll_ms: DEFAULT_IDLE_POLL_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn cron_interval(&self) -> Duration {
        Duration::from_millis(self.cron_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be greater than zero".into()));
        }
        if self.idle_poll_ms == 0 {
            return Err(Error::Config("idle_poll_ms must be greater than zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration for one primary/replica pair.
///
/// # Invariants
/// - `primary_path` and `replica_path` name different files.
/// - `batch_size` and `max_idle_connections` are greater than zero.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// The primary store; every mutation and the change log live here.
    pub primary_path: PathBuf,

    /// The replica store, kept convergent by replication.
    pub replica_path: PathBuf,

    /// Lock wait (milliseconds) for caller-facing operations.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Lock wait (milliseconds) for replication connections.
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,

    /// Where reads go unless the caller asks otherwise.
    #[serde(default)]
    pub default_read: ReadTarget,

    /// Change-log entries per replication pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub journal_mode: JournalMode,

    /// Idle connections kept open per store.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

impl StoreConfig {
    /// Config for `primary`/`replica` with every other field at its default.
    pub fn new(primary_path: impl Into<PathBuf>, replica_path: impl Into<PathBuf>) -> Self {
        Self {
            primary_path: primary_path.into(),
            replica_path: replica_path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            replication_timeout_ms: DEFAULT_REPLICATION_TIMEOUT_MS,
            default_read: ReadTarget::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            journal_mode: JournalMode::default(),
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary_path == self.replica_path {
            return Err(Error::Config(format!(
                "primary and replica must be different files, both are {}",
                self.primary_path.display()
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".into()));
        }
        if self.max_idle_connections == 0 {
            return Err(Error::Config(
                "max_idle_connections must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// A whole deployment: one scheduler shared by any number of store pairs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

impl Config {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        for store in &self.stores {
            store.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
