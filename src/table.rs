//! # Tables
//!
//! A [`Table`] is the caller's view of one replicated table. Writes go to the
//! primary; reads go wherever the [`ReadRouter`] sends them.
//!
//! ## Write Path
//!
//! ```text
//!   insert / update / delete
//!        │
//!        ▼
//!   BEGIN IMMEDIATE (primary)
//!        │  collect ids ─── none? ──► rollback, return 0
//!        │  mutate by id
//!        │  re-read rows by id
//!        │  append change-log record(s)
//!   COMMIT
//!        │
//!        ▼
//!   scheduler.enqueue(replication pass)   (never waits for it)
//! ```
//!
//! `BEGIN IMMEDIATE` takes the write lock up front, so the id collection and
//! the mutation see the same rows. A lock that stays taken past the busy
//! timeout surfaces as [`Error::Busy`](crate::Error::Busy); writes are never
//! retried here.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sqlite_rw::{Filter, Row, RwDatabase, Scheduler, SchedulerConfig, StoreConfig};
//!
//! let scheduler = Scheduler::start(SchedulerConfig::default())?;
//! let db = RwDatabase::open(StoreConfig::new("write.db", "read.db"), &scheduler.handle())?;
//! let users = db.table("user");
//!
//! let id = users.insert(Row::new().with("name", "a").with("age", 1))?;
//! users.update(Filter::eq("id", id), Row::new().with("age", 2))?;
//! let fresh = users.select_first_from_write(Filter::eq("id", id))?;
//! # let _ = fresh;
//! # Ok::<(), sqlite_rw::Error>(())
//! ```

use std::sync::Arc;

use rusqlite::TransactionBehavior;

use crate::changelog::{self, Operation};
use crate::error::{Error, Result};
use crate::replicator::{PassReport, Replicator};
use crate::router::{ReadRouter, ReadTarget};
use crate::scheduler::SchedulerHandle;
use crate::store::{delete_where, insert_row, query_rows, select_ids, update_where, Store};
use crate::types::{quote_ident, Filter, Row, Select, Value, ID_COLUMN};

/// One replicated table.
///
/// Cheap to clone; clones share stores, scheduler and replicator.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    primary: Arc<Store>,
    router: ReadRouter,
    scheduler: SchedulerHandle,
    replicator: Arc<Replicator>,
}

impl Table {
    pub(crate) fn new(
        name: impl Into<String>,
        primary: Arc<Store>,
        router: ReadRouter,
        scheduler: SchedulerHandle,
        replicator: Arc<Replicator>,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            router,
            scheduler,
            replicator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts `row` and returns its rowid. An empty row inserts defaults.
    pub fn insert(&self, row: Row) -> Result<i64> {
        let id = self.primary.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let id = insert_row(&tx, &self.name, &row)?;
            let sql = format!("SELECT * FROM {} WHERE rowid = ?", quote_ident(&self.name));
            let written = query_rows(&tx, &sql, &[Value::Integer(id)])?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Schema(format!("row {id} of {} vanished after insert", self.name)))?;

            changelog::append(&tx, &self.name, &Operation::Insert(written))?;
            tx.commit()?;
            Ok(id)
        })?;

        self.trigger_replication();
        Ok(id)
    }

    /// Sets `fields` on every row matching `filter`. Returns rows affected.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `fields` is empty or sets the primary
    /// key. Replay finds rows by `id`, so a changed key cannot be replicated.
    pub fn update(&self, filter: impl Into<Filter>, fields: Row) -> Result<usize> {
        if fields.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "update of {} with no fields",
                self.name
            )));
        }
        if fields.contains(ID_COLUMN) {
            return Err(Error::InvalidArgument(format!(
                "update of {} cannot change the {ID_COLUMN} column",
                self.name
            )));
        }
        let filter = filter.into();

        let affected = self.primary.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ids = select_ids(&tx, &self.name, &filter)?;
            if ids.is_empty() {
                return Ok(0);
            }
            let by_id = Filter::ids(&ids);
            let affected = update_where(&tx, &self.name, &fields, &by_id)?;

            let (clause, params) = by_id.to_sql();
            let sql = format!("SELECT * FROM {}{clause}", quote_ident(&self.name));
            for row in query_rows(&tx, &sql, &params)? {
                changelog::append(&tx, &self.name, &Operation::Update(row))?;
            }

            tx.commit()?;
            Ok(affected)
        })?;

        if affected > 0 {
            self.trigger_replication();
        }
        Ok(affected)
    }

    /// Deletes every row matching `filter`. Returns rows affected.
    ///
    /// One change-log record carries the whole id list.
    pub fn delete(&self, filter: impl Into<Filter>) -> Result<usize> {
        let filter = filter.into();

        let affected = self.primary.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ids = select_ids(&tx, &self.name, &filter)?;
            if ids.is_empty() {
                return Ok(0);
            }
            let affected = delete_where(&tx, &self.name, &Filter::ids(&ids))?;
            let ids = ids.into_iter().map(Value::Integer).collect();
            changelog::append(&tx, &self.name, &Operation::DeleteByIds(ids))?;

            tx.commit()?;
            Ok(affected)
        })?;

        if affected > 0 {
            self.trigger_replication();
        }
        Ok(affected)
    }

    fn trigger_replication(&self) {
        self.scheduler.enqueue(self.replicator.task());
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Rows matching `select`, from the default read target.
    pub fn select(&self, select: impl Into<Select>) -> Result<Vec<Row>> {
        self.select_on(None, select)
    }

    /// Rows matching `select`, from the primary.
    pub fn select_from_write(&self, select: impl Into<Select>) -> Result<Vec<Row>> {
        self.select_on(Some(ReadTarget::Primary), select)
    }

    /// Rows matching `select` from `target` (`None` for the default).
    pub fn select_on(&self, target: Option<ReadTarget>, select: impl Into<Select>) -> Result<Vec<Row>> {
        self.router.select(target, &self.name, &select.into())
    }

    pub fn select_first(&self, select: impl Into<Select>) -> Result<Option<Row>> {
        self.router.select_first(None, &self.name, &select.into())
    }

    pub fn select_first_from_write(&self, select: impl Into<Select>) -> Result<Option<Row>> {
        self.router
            .select_first(Some(ReadTarget::Primary), &self.name, &select.into())
    }

    pub fn count(&self, filter: impl Into<Filter>) -> Result<i64> {
        self.router.count(None, &self.name, &filter.into())
    }

    pub fn count_from_write(&self, filter: impl Into<Filter>) -> Result<i64> {
        self.router
            .count(Some(ReadTarget::Primary), &self.name, &filter.into())
    }

    /// Raw SQL against the default read target.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.router.query(None, sql, params)
    }

    pub fn query_from_write(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.router.query(Some(ReadTarget::Primary), sql, params)
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Runs one replication pass on the calling thread.
    ///
    /// The pass covers the whole change log of the primary, not only this
    /// table's records; replay order is global.
    pub fn copy_to_read(&self) -> Result<PassReport> {
        self.replicator.run_pass()
    }
}

// =============================================================================
// Tests
// =============================================================================
