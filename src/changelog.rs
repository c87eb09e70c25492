//! # The Change Log
//!
//! Every mutation on the primary appends one record to the `binlog` table in
//! the **same transaction** as the mutation itself. If the transaction rolls
//! back, so does the record, so the log never describes a change the primary
//! does not have.
//!
//! ```text
//!   BEGIN IMMEDIATE
//!     UPDATE user SET age = 2 WHERE id IN (1)
//!     INSERT INTO binlog (table_name, op_type, data)
//!          VALUES ('user', 'update', '{"age":2,"id":1,"name":"a"}')
//!   COMMIT
//! ```
//!
//! ## Record Format
//!
//! | op_type | data |
//! |---------|------|
//! | `insert` | the inserted row as a JSON object |
//! | `update` | the full post-update row as a JSON object (must carry `id`) |
//! | `delete_by_ids` | JSON array of the deleted primary keys |
//!
//! Records are consumed in ascending `id` order and removed one at a time
//! after they have been applied to the replica. The log is the only record of
//! pending work; nothing else needs to survive a restart.

use rusqlite::{params, Connection, Transaction};

use crate::error::{Error, Result};
use crate::schema::{PrimaryKey, TableManager};
use crate::types::{Row, Value};

/// Name of the change-log table on the primary.
pub const CHANGELOG_TABLE: &str = "binlog";

// =============================================================================
// Operations
// =============================================================================

/// The three kinds of change a record can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    DeleteByIds,
}

impl OpType {
    /// The text stored in the `op_type` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::DeleteByIds => "delete_by_ids",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(OpType::Insert),
            "update" => Some(OpType::Update),
            "delete_by_ids" => Some(OpType::DeleteByIds),
            _ => None,
        }
    }
}

/// A decoded change.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// A new row, as read back from the primary after the insert.
    Insert(Row),
    /// A row after update. Always carries its `id`.
    Update(Row),
    /// Primary keys of rows removed by one delete call.
    DeleteByIds(Vec<Value>),
}

impl Operation {
    pub fn op_type(&self) -> OpType {
        match self {
            Operation::Insert(_) => OpType::Insert,
            Operation::Update(_) => OpType::Update,
            Operation::DeleteByIds(_) => OpType::DeleteByIds,
        }
    }

    /// JSON text for the `data` column.
    pub fn encode_payload(&self) -> Result<String> {
        let json = match self {
            Operation::Insert(row) | Operation::Update(row) => row.to_json()?,
            Operation::DeleteByIds(ids) => serde_json::Value::Array(
                ids.iter().map(Value::to_json).collect::<Result<Vec<_>>>()?,
            ),
        };
        Ok(serde_json::to_string(&json)?)
    }
}

// =============================================================================
// Entries
// =============================================================================

/// One row of the change log, as stored.
///
/// `op_type` and `data` are kept as raw text so a record that cannot be
/// decoded can still be read, reported and left in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    pub op_type: String,
    pub data: String,
}

impl ChangeLogEntry {
    /// Decodes `op_type` and `data`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownOpType`] for an `op_type` outside the three known ones
    /// - [`Error::MalformedEntry`] when `data` does not match the op_type
    pub fn operation(&self) -> Result<Operation> {
        let op_type = OpType::parse(&self.op_type).ok_or_else(|| Error::UnknownOpType {
            id: self.id,
            op_type: self.op_type.clone(),
        })?;

        let malformed = |reason: String| Error::MalformedEntry {
            id: self.id,
            reason,
        };

        let json: serde_json::Value =
            serde_json::from_str(&self.data).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

        match op_type {
            OpType::Insert => {
                let row = Row::from_json(&json).map_err(|e| malformed(e.to_string()))?;
                Ok(Operation::Insert(row))
            }
            OpType::Update => {
                let row = Row::from_json(&json).map_err(|e| malformed(e.to_string()))?;
                if row.id().is_none() {
                    return Err(malformed("update payload has no integer id".to_string()));
                }
                Ok(Operation::Update(row))
            }
            OpType::DeleteByIds => {
                let items = json
                    .as_array()
                    .ok_or_else(|| malformed(format!("expected an array of ids, found {json}")))?;
                let ids = items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| malformed(e.to_string()))?;
                Ok(Operation::DeleteByIds(ids))
            }
        }
    }
}

// =============================================================================
// Table Access
// =============================================================================

/// Creates the change-log table on the manager's stores (primary only in
/// practice). Idempotent.
pub fn ensure_table(manager: &TableManager) -> Result<()> {
    manager.ensure_table(&PrimaryKey::AutoIncrement)?;
    let empty = Value::from("");
    for column in ["table_name", "op_type", "data"] {
        manager.ensure_column(column, "TEXT", Some(&empty), false)?;
    }
    Ok(())
}

/// Appends one record inside the caller's transaction.
///
/// Taking a [`Transaction`] rather than a [`Connection`] means the record
/// cannot be written outside the mutation it describes.
pub fn append(tx: &Transaction<'_>, table_name: &str, op: &Operation) -> Result<i64> {
    let data = op.encode_payload()?;
    tx.execute(
        "INSERT INTO binlog (table_name, op_type, data) VALUES (?1, ?2, ?3)",
        params![table_name, op.op_type().as_str(), data],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Up to `limit` records, oldest first. Nothing is removed.
pub fn drain_batch(conn: &Connection, limit: usize) -> Result<Vec<ChangeLogEntry>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        "SELECT id, table_name, op_type, data FROM binlog ORDER BY id ASC LIMIT ?1",
    )?;
    let entries = stmt
        .query_map([limit], |row| {
            Ok(ChangeLogEntry {
                id: row.get(0)?,
                table_name: row.get(1)?,
                op_type: row.get(2)?,
                data: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Deletes one record. Removing an id that is already gone is not an error.
pub fn remove(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM binlog WHERE id = ?1", [id])?;
    Ok(())
}

/// Total records waiting to be replicated.
pub fn pending_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(1) FROM binlog", [], |row| row.get(0))?)
}

/// Records waiting to be replicated for one table.
pub fn pending_for_table(conn: &Connection, table_name: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(1) FROM binlog WHERE table_name = ?1",
        [table_name],
        |row| row.get(0),
    )?)
}

// =============================================================================
// Tests
// =============================================================================
