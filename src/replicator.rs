//! # Replication
//!
//! A replication pass moves one batch of change-log records from the primary
//! onto the replica:
//!
//! ```text
//!   lock ──► open write.db + read.db ──► drain_batch(10)
//!                                           │
//!             ┌─────────────────────────────┘
//!             ▼
//!        for entry in batch (ascending id):
//!             apply_entry(read.db, entry)   ── error ──► stop, keep entry
//!             remove(write.db, entry.id)
//!   unlock (guard dropped on every path)
//! ```
//!
//! ## Apply Then Remove
//!
//! Each record is removed right after it has been applied, not in one batch
//! transaction at the end. A failure halfway through a batch leaves exactly
//! the records that were not applied. The only window for a duplicate is a
//! crash between apply and remove; replay tolerates that:
//!
//! - `insert`: a primary-key conflict on the replica is ignored
//! - `update`: setting the same fields twice gives the same row
//! - `delete_by_ids`: deleting absent rows affects nothing
//!
//! ## Locking
//!
//! All replicators built against one scheduler share one [`ReplicationLock`],
//! so two triggers never replay concurrently and records are never applied
//! out of order.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use rusqlite::Connection;

use crate::changelog::{self, ChangeLogEntry, Operation};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::{delete_where, insert_row, open_connection, update_where, ConnectionOptions};
use crate::types::{Filter, ID_COLUMN};

// =============================================================================
// Replication Lock
// =============================================================================

/// Serialises replication passes.
///
/// Owned by the [`Scheduler`](crate::Scheduler) and cloned into every
/// replicator it serves. Clones share the same mutex.
#[derive(Debug, Clone, Default)]
pub struct ReplicationLock(Arc<Mutex<()>>);

impl ReplicationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other pass holds the lock.
    ///
    /// The mutex guards no data, so a pass that panicked while holding it
    /// leaves nothing to repair and poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `None` while a pass is running.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.0.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// Outcome of a successful [`Replicator::run_pass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassReport {
    /// Records applied and removed.
    pub applied: usize,
    /// Records fetched but not applied. Zero unless the pass was cut short.
    pub remaining_in_batch: usize,
}

// =============================================================================
// Replicator
// =============================================================================

/// Replays the change log of one primary onto its replica.
#[derive(Debug, Clone)]
pub struct Replicator {
    primary_path: PathBuf,
    replica_path: PathBuf,
    options: ConnectionOptions,
    batch_size: usize,
    lock: ReplicationLock,
}

impl Replicator {
    /// Builds a replicator for `config`'s pair. Connections use the
    /// replication timeout, not the caller-facing one.
    pub fn new(config: &StoreConfig, lock: ReplicationLock) -> Self {
        Self {
            primary_path: config.primary_path.clone(),
            replica_path: config.replica_path.clone(),
            options: ConnectionOptions {
                busy_timeout: config.replication_timeout(),
                journal_mode: config.journal_mode,
            },
            batch_size: config.batch_size,
            lock,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Runs one pass over at most `batch_size` records.
    ///
    /// # Errors
    ///
    /// The first failure stops the pass and is returned after being logged;
    /// records from the failing one onwards stay in the log.
    /// [`Error::is_retryable`] tells a busy store apart from a bad record.
    pub fn run_pass(&self) -> Result<PassReport> {
        let _guard = self.lock.lock();

        let primary = open_connection(&self.primary_path, &self.options)?;
        let replica = open_connection(&self.replica_path, &self.options)?;

        let batch = changelog::drain_batch(&primary, self.batch_size)?;
        if batch.is_empty() {
            return Ok(PassReport::default());
        }

        let mut report = PassReport {
            applied: 0,
            remaining_in_batch: batch.len(),
        };

        for entry in &batch {
            let step = apply_entry(&replica, entry).and_then(|()| changelog::remove(&primary, entry.id));
            if let Err(e) = step {
                self.log_failure(entry, &report, &e);
                return Err(e);
            }
            report.applied += 1;
            report.remaining_in_batch -= 1;
        }

        tracing::debug!(
            primary = %self.primary_path.display(),
            applied = report.applied,
            "replication pass complete"
        );
        Ok(report)
    }

    /// Runs passes until the log is empty. Returns the records applied.
    ///
    /// Used where the caller needs the replica caught up before continuing,
    /// e.g. in tests or before a planned failover.
    pub fn drain_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let report = self.run_pass()?;
            total += report.applied;
            if report.applied < self.batch_size {
                break;
            }
        }
        if total > 0 {
            tracing::info!(primary = %self.primary_path.display(), applied = total, "replica caught up");
        }
        Ok(total)
    }

    /// A task for the [`Scheduler`](crate::Scheduler): one pass.
    ///
    /// Errors are returned so the scheduler logs them, including a busy
    /// store met before the first record. Unapplied records are picked up
    /// by the next trigger.
    pub fn task(self: &Arc<Self>) -> impl Fn() -> Result<()> + Send + Sync + 'static {
        let replicator = Arc::clone(self);
        move || replicator.run_pass().map(|_| ())
    }

    fn log_failure(&self, entry: &ChangeLogEntry, report: &PassReport, e: &Error) {
        if e.is_retryable() {
            tracing::warn!(
                primary = %self.primary_path.display(),
                entry_id = entry.id,
                applied = report.applied,
                remaining = report.remaining_in_batch,
                error = %e,
                "replication pass stopped on a busy store; will retry"
            );
        } else {
            tracing::error!(
                primary = %self.primary_path.display(),
                entry_id = entry.id,
                table = %entry.table_name,
                op_type = %entry.op_type,
                applied = report.applied,
                error = %e,
                "replication pass stopped on a record it cannot apply"
            );
        }
    }
}

// =============================================================================
// Applying Records
// =============================================================================

/// Applies one record to `conn` (the replica).
///
/// Nothing is removed from the log here; the caller does that once this
/// returns `Ok`.
pub fn apply_entry(conn: &Connection, entry: &ChangeLogEntry) -> Result<()> {
    let table = entry.table_name.as_str();
    match entry.operation()? {
        Operation::Insert(row) => match insert_row(conn, table, &row) {
            Ok(_) => Ok(()),
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(entry_id = entry.id, table, error = %e, "insert already applied");
                Ok(())
            }
            Err(e) => Err(e),
        },
        Operation::Update(row) => {
            let id = row.id().ok_or_else(|| Error::MalformedEntry {
                id: entry.id,
                reason: "update payload has no integer id".to_string(),
            })?;
            update_where(conn, table, &row, &Filter::eq(ID_COLUMN, id))?;
            Ok(())
        }
        Operation::DeleteByIds(ids) => {
            delete_where(conn, table, &Filter::id_in(&ids)?)?;
            Ok(())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Row;

    fn replica() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE user (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, age INTEGER)",
        )
        .unwrap();
        conn
    }

    fn entry(id: i64, op: Operation) -> ChangeLogEntry {
        ChangeLogEntry {
            id,
            table_name: "user".into(),
            op_type: op.op_type().as_str().into(),
            data: op.encode_payload().unwrap(),
        }
    }

    fn rows(conn: &Connection) -> Vec<Row> {
        crate::store::query_rows(conn, "SELECT * FROM user ORDER BY id", &[]).unwrap()
    }

    #[test]
    fn test_apply_insert_update_delete() {
        let conn = replica();
        let row = Row::new().with("id", 1).with("name", "a").with("age", 1);

        apply_entry(&conn, &entry(1, Operation::Insert(row.clone()))).unwrap();
        assert_eq!(rows(&conn), vec![row.clone()]);

        let updated = row.with("age", 2);
        apply_entry(&conn, &entry(2, Operation::Update(updated.clone()))).unwrap();
        assert_eq!(rows(&conn), vec![updated]);

        apply_entry(&conn, &entry(3, Operation::DeleteByIds(vec![1.into()]))).unwrap();
        assert!(rows(&conn).is_empty());
    }

    /// Replaying any record twice gives the same replica.
    #[test]
    fn test_replay_is_idempotent() {
        let conn = replica();
        let row = Row::new().with("id", 1).with("name", "a").with("age", 1);
        let log = [
            entry(1, Operation::Insert(row.clone())),
            entry(2, Operation::Update(row.clone().with("age", 5))),
        ];
        for e in log.iter().chain(log.iter()) {
            apply_entry(&conn, e).unwrap();
        }
        assert_eq!(rows(&conn), vec![row.with("age", 5)]);

        let delete = entry(3, Operation::DeleteByIds(vec![1.into(), 2.into()]));
        apply_entry(&conn, &delete).unwrap();
        apply_entry(&conn, &delete).unwrap();
        assert!(rows(&conn).is_empty());
    }

    #[test]
    fn test_unknown_op_is_not_applied() {
        let conn = replica();
        let bad = ChangeLogEntry {
            id: 4,
            table_name: "user".into(),
            op_type: "truncate".into(),
            data: "{}".into(),
        };
        let err = apply_entry(&conn, &bad).unwrap_err();
        assert!(matches!(err, Error::UnknownOpType { id: 4, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_null_failure_is_not_treated_as_applied() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE user (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .unwrap();
        let row = Row::new().with("id", 1).with("name", crate::Value::Null);

        let err = apply_entry(&conn, &entry(1, Operation::Insert(row))).unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(!err.is_unique_violation());
    }

    /// A busy primary before the first record still fails the scheduled task.
    #[test]
    fn test_task_returns_busy_from_locked_primary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path().join("w.db"), dir.path().join("r.db"));
        config.journal_mode = crate::JournalMode::Delete;
        config.replication_timeout_ms = 50;

        let holder = Connection::open(&config.primary_path).unwrap();
        holder.execute_batch("CREATE TABLE t (x); BEGIN EXCLUSIVE").unwrap();

        let replicator = Arc::new(Replicator::new(&config, ReplicationLock::new()));
        let err = replicator.task()().unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");

        holder.execute_batch("COMMIT").unwrap();
    }

    #[test]
    fn test_lock_is_shared_between_clones() {
        let lock = ReplicationLock::new();
        let clone = lock.clone();
        let guard = lock.lock();
        assert!(clone.try_lock().is_none());
        drop(guard);
        assert!(clone.try_lock().is_some());
    }
}
