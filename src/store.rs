//! # Store Access
//!
//! A [`Store`] is one SQLite file plus a small pool of idle connections.
//!
//! ## Why a Pool?
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, so a connection cannot be
//! shared between threads behind an `Arc`. Each call checks a connection out
//! of the pool (opening a new one if the pool is empty), uses it exclusively,
//! and returns it afterwards:
//!
//! ```text
//!   thread A ──► with_conn ──► [conn 1] ──┐
//!   thread B ──► with_conn ──► [conn 2] ──┼──► write.db / read.db
//!   thread C ──► with_conn ──► [conn 3] ──┘
//!                    ▲
//!                    └── idle: Mutex<Vec<Connection>>
//! ```
//!
//! Concurrent readers therefore never share a connection and never wait on
//! each other. Writers still serialise on SQLite's file lock; a writer that
//! waits longer than the busy timeout gets [`Error::Busy`](crate::Error::Busy).
//!
//! ## SQL Helpers
//!
//! The free functions at the bottom ([`insert_row`], [`update_where`],
//! [`delete_where`], [`query_rows`]) build statements from [`Row`]s and
//! [`Filter`]s. Both the write path and replication use them, so the primary
//! and the replica see exactly the same SQL shapes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params_from_iter, Connection};

use crate::config::JournalMode;
use crate::error::Result;
use crate::types::{placeholders, quote_ident, Filter, Row, Value};

// =============================================================================
// Connection Options
// =============================================================================

/// Settings applied to every connection opened for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// How long a statement waits on a locked database before failing busy.
    pub busy_timeout: Duration,
    pub journal_mode: JournalMode,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(crate::config::DEFAULT_BUSY_TIMEOUT_MS),
            journal_mode: JournalMode::default(),
        }
    }
}

/// Opens a read-write connection and applies `options`.
///
/// The replicator uses this directly for its short-lived connections; stores
/// use it to fill their pools.
pub fn open_connection(path: &Path, options: &ConnectionOptions) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Busy timeout first: the journal_mode pragma may itself need the lock.
    conn.busy_timeout(options.busy_timeout)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = {}",
        options.journal_mode.pragma_value()
    ))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;

    Ok(conn)
}

// =============================================================================
// Store
// =============================================================================

/// One SQLite file with pooled connections.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    options: ConnectionOptions,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl Store {
    /// Opens (creating if needed) the file at `path`.
    ///
    /// One connection is opened eagerly so that a bad path or an unusable
    /// file fails here rather than on first use.
    pub fn open(
        path: impl AsRef<Path>,
        options: ConnectionOptions,
        max_idle: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, &options)?;

        tracing::debug!(path = %path.display(), ?options, "opened store");

        Ok(Self {
            path,
            options,
            idle: Mutex::new(vec![conn]),
            max_idle: max_idle.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Number of connections currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Runs `f` with a connection checked out of the pool.
    ///
    /// The connection goes back to the pool afterwards unless the pool is
    /// full or `f` left a transaction open.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.checkout()?;
        let result = f(&mut conn);
        self.checkin(conn);
        result
    }

    fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle().pop() {
            return Ok(conn);
        }
        open_connection(&self.path, &self.options)
    }

    fn checkin(&self, conn: Connection) {
        if !conn.is_autocommit() {
            tracing::warn!(path = %self.path.display(), "dropping connection with an open transaction");
            return;
        }
        let mut idle = self.idle();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    /// The pool only holds connections; a panic elsewhere cannot leave it in
    /// a bad state, so poisoning is ignored.
    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// SQL Helpers
// =============================================================================

/// Runs a query and converts every result row into a [`Row`].
pub fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(Row::from_sql_row(row, &names)?);
    }
    Ok(out)
}

/// Inserts `row` into `table` and returns the new rowid.
pub fn insert_row(conn: &Connection, table: &str, row: &Row) -> Result<i64> {
    let sql = if row.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
    } else {
        let columns = row.columns().map(quote_ident).collect::<Vec<_>>().join(", ");
        format!(
            "INSERT INTO {} ({columns}) VALUES ({})",
            quote_ident(table),
            placeholders(row.len())
        )
    };
    tracing::debug!(%sql, "insert");

    conn.execute(&sql, params_from_iter(row.values()))?;
    Ok(conn.last_insert_rowid())
}

/// `UPDATE table SET fields... WHERE filter`; returns affected rows.
pub fn update_where(conn: &Connection, table: &str, fields: &Row, filter: &Filter) -> Result<usize> {
    let assignments = fields
        .columns()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let (clause, filter_params) = filter.to_sql();
    let sql = format!("UPDATE {} SET {assignments}{clause}", quote_ident(table));
    tracing::debug!(%sql, "update");

    let params = fields.values().chain(filter_params.iter());
    Ok(conn.execute(&sql, params_from_iter(params))?)
}

/// `DELETE FROM table WHERE filter`; returns affected rows.
pub fn delete_where(conn: &Connection, table: &str, filter: &Filter) -> Result<usize> {
    let (clause, params) = filter.to_sql();
    let sql = format!("DELETE FROM {}{clause}", quote_ident(table));
    tracing::debug!(%sql, "delete");

    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
}

/// Primary keys of the rows matching `filter`, ascending.
pub fn select_ids(conn: &Connection, table: &str, filter: &Filter) -> Result<Vec<i64>> {
    let (clause, params) = filter.to_sql();
    let sql = format!(
        "SELECT {id} FROM {}{clause} ORDER BY {id}",
        quote_ident(table),
        id = quote_ident(crate::types::ID_COLUMN)
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(params.iter()), |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

// =============================================================================
// Tests
// =============================================================================
