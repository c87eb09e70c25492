//! # Async API
//!
//! [`AsyncTable`] exposes a [`Table`] to Tokio code.
//!
//! ## The SQLite Challenge
//!
//! Every table operation blocks: it waits on SQLite file locks (up to the
//! busy timeout) and on disk I/O. Running that on a runtime worker thread
//! would stall every other task scheduled there. Each call is therefore moved
//! onto Tokio's blocking pool:
//!
//! ```text
//!   async task ──► spawn_blocking(move || table.insert(row)) ──► .await
//!                        │
//!                        ▼
//!               blocking pool thread
//!               Store::with_conn (pooled rusqlite::Connection)
//! ```
//!
//! `Table` is `Clone + Send + Sync` (stores are shared behind `Arc`, and each
//! call checks out its own connection), so a clone moves into each closure.
//! Replication itself stays on the [`Scheduler`](crate::Scheduler) thread.

use tokio::task;

use crate::error::{Error, Result};
use crate::replicator::PassReport;
use crate::router::ReadTarget;
use crate::table::Table;
use crate::types::{Filter, Row, Select, Value};

/// Async wrapper around a [`Table`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AsyncTable {
    table: Table,
}

impl From<Table> for AsyncTable {
    fn from(table: Table) -> Self {
        Self::new(table)
    }
}

impl AsyncTable {
    pub fn new(table: Table) -> Self {
        Self { table }
    }

    /// The wrapped synchronous table.
    pub fn blocking(&self) -> &Table {
        &self.table
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Table) -> Result<T> + Send + 'static,
    {
        let table = self.table.clone();
        task::spawn_blocking(move || f(table))
            .await
            .map_err(|e| Error::Runtime(format!("blocking table task failed: {e}")))?
    }

    pub async fn insert(&self, row: Row) -> Result<i64> {
        self.run(move |t| t.insert(row)).await
    }

    pub async fn update(&self, filter: impl Into<Filter>, fields: Row) -> Result<usize> {
        let filter = filter.into();
        self.run(move |t| t.update(filter, fields)).await
    }

    pub async fn delete(&self, filter: impl Into<Filter>) -> Result<usize> {
        let filter = filter.into();
        self.run(move |t| t.delete(filter)).await
    }

    pub async fn select(&self, select: impl Into<Select>) -> Result<Vec<Row>> {
        self.select_on(None, select).await
    }

    pub async fn select_from_write(&self, select: impl Into<Select>) -> Result<Vec<Row>> {
        self.select_on(Some(ReadTarget::Primary), select).await
    }

    pub async fn select_on(
        &self,
        target: Option<ReadTarget>,
        select: impl Into<Select>,
    ) -> Result<Vec<Row>> {
        let select = select.into();
        self.run(move |t| t.select_on(target, select)).await
    }

    pub async fn select_first(&self, select: impl Into<Select>) -> Result<Option<Row>> {
        let select = select.into();
        self.run(move |t| t.select_first(select)).await
    }

    pub async fn count(&self, filter: impl Into<Filter>) -> Result<i64> {
        let filter = filter.into();
        self.run(move |t| t.count(filter)).await
    }

    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<Vec<Row>> {
        let sql = sql.into();
        self.run(move |t| t.query(&sql, &params)).await
    }

    /// One replication pass, on the blocking pool.
    pub async fn copy_to_read(&self) -> Result<PassReport> {
        self.run(|t| t.copy_to_read()).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PrimaryKey, RwDatabase, Scheduler, SchedulerConfig, StoreConfig};

    fn open(dir: &tempfile::TempDir, scheduler: &Scheduler) -> RwDatabase {
        let config = StoreConfig::new(dir.path().join("w.db"), dir.path().join("r.db"));
        let db = RwDatabase::open(config, &scheduler.handle()).unwrap();
        let manager = db.table_manager("user");
        manager.ensure_table(&PrimaryKey::AutoIncrement).unwrap();
        manager.ensure_column("name", "TEXT", None, false).unwrap();
        db
    }

    #[tokio::test]
    async fn test_async_roundtrip_through_replica() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let db = open(&dir, &scheduler);
        let users = AsyncTable::from(db.table("user"));

        let id = users.insert(Row::new().with("name", "a")).await.unwrap();
        assert_eq!(id, 1);

        let fresh = users.select_from_write(Filter::eq("id", id)).await.unwrap();
        assert_eq!(fresh[0].get_str("name"), Some("a"));

        // Whatever the background worker already did, a manual pass finishes the job.
        db.sync_now().unwrap();
        assert_eq!(users.count(Filter::All).await.unwrap(), 1);

        assert_eq!(users.update(Filter::eq("id", id), Row::new().with("name", "b")).await.unwrap(), 1);
        assert_eq!(users.delete(Filter::eq("name", "nobody")).await.unwrap(), 0);
        db.sync_now().unwrap();

        let first = users.select_first(Filter::All).await.unwrap().unwrap();
        assert_eq!(first.get_str("name"), Some("b"));
        let rows = users
            .query("SELECT name FROM user WHERE id = ?", vec![Value::Integer(id)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let db = open(&dir, &scheduler);
        let users = AsyncTable::new(db.table("user"));

        let err = users.update(Filter::All, Row::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = users.select(Select::new().order_by("no_such_column")).await.unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_copy_to_read_on_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let db = open(&dir, &scheduler);
        let users = AsyncTable::new(db.table("user"));

        let report = users.copy_to_read().await.unwrap();
        assert_eq!(report, PassReport::default());
        scheduler.shutdown();
    }
}
