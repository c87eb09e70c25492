//! # Read Routing
//!
//! Reads are served from either store. The replica is the default so that
//! read traffic never queues behind the primary's writer lock; the primary is
//! available for callers that need to see a write they just made, before
//! replication has caught up.
//!
//! ```text
//!            select / count / query
//!                     │
//!             ┌───────┴────────┐
//!             │   ReadRouter   │  default target from config,
//!             └───────┬────────┘  overridable per call
//!          Primary    │    Replica
//!        ┌────────────┴────────────┐
//!        ▼                         ▼
//!   ┌─────────┐               ┌─────────┐
//!   │ write.db│ ──binlog──►   │ read.db │
//!   └─────────┘  (async)      └─────────┘
//! ```

use std::sync::Arc;

use serde::Deserialize;

use crate::error::Result;
use crate::store::{query_rows, Store};
use crate::types::{quote_ident, Filter, Row, Select, Value};

/// Which store serves a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadTarget {
    /// The primary (write) store: read-your-writes.
    #[serde(alias = "write")]
    Primary,
    /// The replica (read) store: eventually consistent.
    #[default]
    #[serde(alias = "read")]
    Replica,
}

/// Serves reads against one primary/replica pair.
#[derive(Debug, Clone)]
pub struct ReadRouter {
    primary: Arc<Store>,
    replica: Arc<Store>,
    default_target: ReadTarget,
}

impl ReadRouter {
    pub fn new(primary: Arc<Store>, replica: Arc<Store>, default_target: ReadTarget) -> Self {
        Self {
            primary,
            replica,
            default_target,
        }
    }

    pub fn default_target(&self) -> ReadTarget {
        self.default_target
    }

    /// Resolves `None` to the configured default.
    pub fn store(&self, target: Option<ReadTarget>) -> &Arc<Store> {
        match target.unwrap_or(self.default_target) {
            ReadTarget::Primary => &self.primary,
            ReadTarget::Replica => &self.replica,
        }
    }

    /// Rows of `table` matching `select`.
    pub fn select(&self, target: Option<ReadTarget>, table: &str, select: &Select) -> Result<Vec<Row>> {
        let (sql, params) = select.to_sql(table);
        self.store(target).with_conn(|conn| query_rows(conn, &sql, &params))
    }

    /// First matching row, if any.
    pub fn select_first(
        &self,
        target: Option<ReadTarget>,
        table: &str,
        select: &Select,
    ) -> Result<Option<Row>> {
        let select = select.clone().limit(1);
        Ok(self.select(target, table, &select)?.into_iter().next())
    }

    /// Number of rows of `table` matching `filter`.
    pub fn count(&self, target: Option<ReadTarget>, table: &str, filter: &Filter) -> Result<i64> {
        let (clause, params) = filter.to_sql();
        let sql = format!("SELECT COUNT(1) FROM {}{clause}", quote_ident(table));
        self.store(target).with_conn(|conn| {
            let count = conn.query_row(
                &sql,
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Arbitrary read-only SQL.
    pub fn query(&self, target: Option<ReadTarget>, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.store(target).with_conn(|conn| query_rows(conn, sql, params))
    }
}
