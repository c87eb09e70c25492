//! # Schema Management
//!
//! Replication replays rows by column name, so a table must look the same on
//! both stores. [`TableManager`] applies each DDL operation to the primary and
//! the replica together, and every operation is a no-op when the object
//! already exists. Calling the same setup code on every start-up is therefore
//! safe.
//!
//! ```text
//!   TableManager("user")
//!        │ ensure_table / ensure_column / ensure_index
//!        ├──────────────► write.db
//!        └──────────────► read.db
//! ```
//!
//! The change-log table itself is created through a primary-only manager; it
//! never exists on the replica.
//!
//! ## Metadata
//!
//! The primary also carries a `rw_metadata` key/value table holding
//! the change-log format version. Opening a primary written by an
//! incompatible version fails with [`Error::Schema`] instead of replaying
//! entries it cannot understand.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{quote_ident, Value, ID_COLUMN};

// =============================================================================
// Metadata
// =============================================================================

/// Version of the change-log table layout and payload encoding.
///
/// For v1 there are no migrations; a mismatch is an error.
const CHANGELOG_FORMAT_VERSION: i32 = 1;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS rw_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Creates the metadata table on `store` and checks the format version.
pub fn initialize_metadata(store: &Store) -> Result<()> {
    store.with_conn(|conn| {
        conn.execute_batch(CREATE_METADATA)?;
        verify_or_set_version(conn)
    })
}

/// Reads the stored version, writing the current one on a fresh store.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM rw_metadata WHERE key = 'changelog_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT OR IGNORE INTO rw_metadata (key, value) VALUES ('changelog_version', ?)",
                [CHANGELOG_FORMAT_VERSION.to_string()],
            )?;
        }
        Some(v) if v == CHANGELOG_FORMAT_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "change-log version mismatch: store has version {v}, this build requires {CHANGELOG_FORMAT_VERSION}"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Table Definitions
// =============================================================================

/// How a new table gets its primary key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PrimaryKey {
    /// `id INTEGER PRIMARY KEY AUTOINCREMENT`. Required for replicated tables.
    #[default]
    AutoIncrement,
    /// A caller-chosen key column, e.g. `code TEXT PRIMARY KEY`.
    Named { name: String, sql_type: String },
    /// No key; SQLite needs at least one column, so an `_id` placeholder is
    /// created.
    None,
}

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    /// Default expression as SQLite stores it (already quoted).
    pub default: Option<String>,
    pub primary_key: bool,
}

// =============================================================================
// TableManager
// =============================================================================

/// Idempotent DDL for one table on every store it manages.
#[derive(Debug, Clone)]
pub struct TableManager {
    table: String,
    stores: Vec<Arc<Store>>,
}

impl TableManager {
    /// Manages `table` on the primary and, when given, the replica.
    pub fn new(table: impl Into<String>, primary: Arc<Store>, replica: Option<Arc<Store>>) -> Self {
        let mut stores = vec![primary];
        stores.extend(replica);
        Self {
            table: table.into(),
            stores,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the table unless it already exists.
    pub fn ensure_table(&self, primary_key: &PrimaryKey) -> Result<()> {
        let column = match primary_key {
            PrimaryKey::AutoIncrement => {
                format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(ID_COLUMN))
            }
            PrimaryKey::Named { name, sql_type } => {
                validate_sql_type(sql_type)?;
                format!("{} {sql_type} PRIMARY KEY", quote_ident(name))
            }
            PrimaryKey::None => format!("{} INTEGER", quote_ident("_id")),
        };
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({column})",
            quote_ident(&self.table)
        );

        for store in &self.stores {
            store.with_conn(|conn| {
                if !table_exists(conn, &self.table)? {
                    tracing::info!(table = %self.table, path = %store.path().display(), "creating table");
                    conn.execute_batch(&sql)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Adds a column unless it already exists.
    ///
    /// SQLite cannot add a `NOT NULL` column without a non-null default to a
    /// table; that combination fails with [`Error::Sqlite`] from SQLite.
    pub fn ensure_column(
        &self,
        name: &str,
        sql_type: &str,
        default: Option<&Value>,
        not_null: bool,
    ) -> Result<()> {
        validate_sql_type(sql_type)?;

        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {sql_type}",
            quote_ident(&self.table),
            quote_ident(name)
        );
        if let Some(default) = default {
            sql.push_str(&format!(" DEFAULT {}", sql_literal(default)?));
        }
        if not_null {
            sql.push_str(" NOT NULL");
        }

        for store in &self.stores {
            store.with_conn(|conn| {
                let exists = column_infos(conn, &self.table)?
                    .iter()
                    .any(|c| c.name == name);
                if !exists {
                    tracing::info!(table = %self.table, column = name, %sql, "adding column");
                    conn.execute_batch(&sql)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Creates `idx_<table>_<col>...` over `columns` unless it exists.
    pub fn ensure_index(&self, columns: &[&str], unique: bool) -> Result<()> {
        if columns.is_empty() {
            return Err(Error::InvalidArgument("an index needs at least one column".into()));
        }
        let sql = format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            quote_ident(&self.index_name(columns)),
            quote_ident(&self.table),
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        );
        for store in &self.stores {
            store.with_conn(|conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Drops the index [`ensure_index`](Self::ensure_index) would create for
    /// `columns`. Failures are logged per store and do not stop the others.
    pub fn drop_index(&self, columns: &[&str]) {
        let sql = format!("DROP INDEX IF EXISTS {}", quote_ident(&self.index_name(columns)));
        for store in &self.stores {
            let result = store.with_conn(|conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            });
            if let Err(e) = result {
                tracing::error!(table = %self.table, path = %store.path().display(), error = %e, "drop index failed");
            }
        }
    }

    /// Columns of the table on the primary.
    pub fn columns(&self) -> Result<Vec<ColumnInfo>> {
        self.stores[0].with_conn(|conn| column_infos(conn, &self.table))
    }

    /// Builds (but does not run) the copy statement for rebuilding the table
    /// without `dropped` columns after it was renamed to `backup_table`.
    pub fn generate_migrate_sql(&self, dropped: &[&str]) -> Result<String> {
        let kept: Vec<String> = self
            .columns()?
            .into_iter()
            .map(|c| c.name)
            .filter(|name| !dropped.contains(&name.as_str()))
            .map(|name| quote_ident(&name))
            .collect();
        if kept.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "dropping {dropped:?} leaves {} without columns",
                self.table
            )));
        }
        let kept = kept.join(", ");
        Ok(format!(
            "INSERT INTO {} ({kept}) SELECT {kept} FROM backup_table",
            quote_ident(&self.table)
        ))
    }

    fn index_name(&self, columns: &[&str]) -> String {
        format!("idx_{}_{}", self.table, columns.join("_"))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn column_infos(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get("name")?,
                sql_type: row.get("type")?,
                not_null: row.get::<_, i64>("notnull")? != 0,
                default: row.get("dflt_value")?,
                primary_key: row.get::<_, i64>("pk")? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Column types are interpolated into DDL; reject anything that could end
/// the statement.
fn validate_sql_type(sql_type: &str) -> Result<()> {
    let ok = !sql_type.trim().is_empty()
        && sql_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')' | ','));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid column type '{sql_type}'")))
    }
}

/// Renders a value as a DDL literal (`DEFAULT` clauses cannot be bound).
fn sql_literal(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) if f.is_finite() => format!("{f:?}"),
        Value::Real(f) => {
            return Err(Error::UnsupportedValue(format!("{f} has no SQL literal")));
        }
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConnectionOptions;

    fn stores() -> (tempfile::TempDir, Arc<Store>, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let open = |name: &str| {
            Arc::new(Store::open(dir.path().join(name), ConnectionOptions::default(), 2).unwrap())
        };
        let (w, r) = (open("w.db"), open("r.db"));
        (dir, w, r)
    }

    #[test]
    fn test_ensure_table_on_both_stores() {
        let (_dir, w, r) = stores();
        let manager = TableManager::new("user", w.clone(), Some(r.clone()));
        manager.ensure_table(&PrimaryKey::AutoIncrement).unwrap();
        manager.ensure_table(&PrimaryKey::AutoIncrement).unwrap();

        for store in [&w, &r] {
            assert!(store.with_conn(|c| table_exists(c, "user")).unwrap());
        }
        let columns = manager.columns().unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].name, "id");
        assert!(columns[0].primary_key);
    }

    #[test]
    fn test_ensure_column_is_idempotent() {
        let (_dir, w, r) = stores();
        let manager = TableManager::new("user", w, Some(r.clone()));
        manager.ensure_table(&PrimaryKey::AutoIncrement).unwrap();

        let default = Value::from("it's");
        manager.ensure_column("name", "TEXT", Some(&default), true).unwrap();
        manager.ensure_column("name", "TEXT", Some(&default), true).unwrap();
        manager.ensure_column("age", "INTEGER", None, false).unwrap();

        let replica = TableManager::new("user", r, None);
        let names: Vec<String> = replica.columns().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["id", "name", "age"]);

        let name = &replica.columns().unwrap()[1];
        assert!(name.not_null);
        assert_eq!(name.default.as_deref(), Some("'it''s'"));
    }

    #[test]
    fn test_named_and_keyless_tables() {
        let (_dir, w, _r) = stores();
        TableManager::new("code", w.clone(), None)
            .ensure_table(&PrimaryKey::Named {
                name: "code".into(),
                sql_type: "TEXT".into(),
            })
            .unwrap();
        TableManager::new("loose", w.clone(), None)
            .ensure_table(&PrimaryKey::None)
            .unwrap();

        let loose = TableManager::new("loose", w, None).columns().unwrap();
        assert_eq!(loose[0].name, "_id");
        assert!(!loose[0].primary_key);
    }

    #[test]
    fn test_index_create_and_drop() {
        let (_dir, w, r) = stores();
        let manager = TableManager::new("user", w, Some(r.clone()));
        manager.ensure_table(&PrimaryKey::AutoIncrement).unwrap();
        manager.ensure_column("name", "TEXT", None, false).unwrap();
        manager.ensure_column("age", "INTEGER", None, false).unwrap();

        manager.ensure_index(&["name", "age"], true).unwrap();
        manager.ensure_index(&["name", "age"], true).unwrap();

        let index_count = |store: &Store| -> i64 {
            store
                .with_conn(|c| {
                    Ok(c.query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_user_name_age'",
                        [],
                        |row| row.get(0),
                    )?)
                })
                .unwrap()
        };
        assert_eq!(index_count(&r), 1);

        manager.drop_index(&["name", "age"]);
        manager.drop_index(&["name", "age"]);
        assert_eq!(index_count(&r), 0);
    }

    #[test]
    fn test_generate_migrate_sql() {
        let (_dir, w, _r) = stores();
        let manager = TableManager::new("user", w, None);
        manager.ensure_table(&PrimaryKey::AutoIncrement).unwrap();
        manager.ensure_column("name", "TEXT", None, false).unwrap();
        manager.ensure_column("legacy", "TEXT", None, false).unwrap();

        let sql = manager.generate_migrate_sql(&["legacy"]).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"user\" (\"id\", \"name\") SELECT \"id\", \"name\" FROM backup_table"
        );
    }

    #[test]
    fn test_bad_column_type_rejected() {
        let (_dir, w, _r) = stores();
        let manager = TableManager::new("user", w, None);
        manager.ensure_table(&PrimaryKey::AutoIncrement).unwrap();
        let err = manager
            .ensure_column("x", "TEXT; DROP TABLE user", None, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_metadata_version() {
        let (_dir, w, _r) = stores();
        initialize_metadata(&w).unwrap();
        initialize_metadata(&w).unwrap();

        w.with_conn(|c| {
            c.execute(
                "UPDATE rw_metadata SET value = '99' WHERE key = 'changelog_version'",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let err = initialize_metadata(&w).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
