//! # Error Handling for sqlite-rw
//!
//! A single error enum ([`Error`]) covers every failure mode of the crate:
//! store access, change-log decoding, configuration and schema management.
//!
//! ## Retryable vs Fatal
//!
//! Replication needs to know whether a failure is worth retrying on the next
//! trigger. That decision is made once, when a `rusqlite` error enters the
//! crate: SQLite's `SQLITE_BUSY` and `SQLITE_LOCKED` result codes become
//! [`Error::Busy`], everything else becomes [`Error::Sqlite`]. Callers then ask
//! [`Error::is_retryable`] instead of looking at message text.
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Contention | `Busy` | Surface to caller / retry on next replication pass |
//! | Data integrity | `UnknownOpType`, `MalformedEntry` | Stop the batch, keep the entry, alert an operator |
//! | Caller mistakes | `InvalidArgument`, `UnsupportedValue` | Fix the call site |
//! | Internal | `Sqlite`, `Json`, `Io`, `Schema`, `Config`, `Runtime` | Log and investigate |

use rusqlite::ErrorCode;
use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in sqlite-rw operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Contention (retryable)
    // =========================================================================

    /// The store stayed locked for longer than the connection's busy timeout.
    ///
    /// # When This Happens
    ///
    /// SQLite allows one writer per file. A second writer, or a writer racing
    /// a reader that holds a rollback-journal lock, waits up to the configured
    /// busy timeout and then gives up with `SQLITE_BUSY` / `SQLITE_LOCKED`.
    ///
    /// # Recovery
    ///
    /// Caller-facing writes propagate this unchanged; nothing is retried in
    /// line. The replicator logs it and leaves the unprocessed change-log
    /// entries for the next pass.
    #[error("database is busy: {0}")]
    Busy(#[source] rusqlite::Error),

    // =========================================================================
    // Change-log integrity (fatal for the current batch)
    // =========================================================================

    /// A change-log entry names an operation this crate does not know.
    ///
    /// The entry is left in the log for operator inspection.
    #[error("change-log entry {id} has unknown op_type '{op_type}'")]
    UnknownOpType {
        /// Change-log id of the offending entry
        id: i64,
        /// The op_type text found in the log
        op_type: String,
    },

    /// A change-log entry's payload could not be decoded for its op_type.
    #[error("change-log entry {id} is malformed: {reason}")]
    MalformedEntry {
        /// Change-log id of the offending entry
        id: i64,
        /// What was wrong with the payload
        reason: String,
    },

    // =========================================================================
    // Caller errors
    // =========================================================================

    /// The call itself was invalid (e.g. an update with no fields).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A value could not be represented as text/integer/real/null.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    // =========================================================================
    // Internal errors
    // =========================================================================

    /// Any other SQLite failure (syntax error, constraint, I/O inside SQLite).
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is present but invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Schema version mismatch or a DDL operation that cannot be honoured.
    #[error("schema error: {0}")]
    Schema(String),

    /// A blocking task spawned by the async facade panicked or was cancelled.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Returns true for lock contention errors that a later attempt may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Returns true when the error signals a bad change-log entry.
    pub fn is_malformed_entry(&self) -> bool {
        matches!(
            self,
            Error::UnknownOpType { .. } | Error::MalformedEntry { .. }
        )
    }

    /// Returns true if SQLite rejected the statement with a constraint
    /// violation (unique, primary key, not null, ...).
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }

    /// Returns true only for a primary-key or unique-index conflict.
    ///
    /// Replay treats these as "already applied". NOT NULL, CHECK and
    /// foreign-key failures are not covered.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            ),
            _ => false,
        }
    }
}

/// Classifies rusqlite errors on the way in.
///
/// # Rust Pattern: Manual From
///
/// `#[from]` would generate a blind wrapper. Writing the impl by hand lets
/// `?` pick the right variant from the SQLite result code, so the rest of
/// the crate never inspects error messages.
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        let busy = matches!(
            &err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
        );
        if busy {
            Error::Busy(err)
        } else {
            Error::Sqlite(err)
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_error_display() {
        let unknown = Error::UnknownOpType {
            id: 7,
            op_type: "upsert".to_string(),
        };
        assert_eq!(
            unknown.to_string(),
            "change-log entry 7 has unknown op_type 'upsert'"
        );

        let malformed = Error::MalformedEntry {
            id: 3,
            reason: "payload is not an object".to_string(),
        };
        assert_eq!(
            malformed.to_string(),
            "change-log entry 3 is malformed: payload is not an object"
        );
    }

    /// SQLITE_BUSY and SQLITE_LOCKED are the only retryable codes.
    #[test]
    fn test_busy_classification() {
        let busy: Error = sqlite_failure(rusqlite::ffi::SQLITE_BUSY).into();
        assert!(matches!(busy, Error::Busy(_)));
        assert!(busy.is_retryable());

        let locked: Error = sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).into();
        assert!(locked.is_retryable());

        let constraint: Error = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).into();
        assert!(!constraint.is_retryable());
        assert!(constraint.is_constraint_violation());
    }

    #[test]
    fn test_unique_violation_is_narrow() {
        let unique: Error = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE).into();
        assert!(unique.is_unique_violation());
        let pk: Error = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY).into();
        assert!(pk.is_unique_violation());

        let not_null: Error = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL).into();
        assert!(not_null.is_constraint_violation());
        assert!(!not_null.is_unique_violation());
    }

    #[test]
    fn test_non_sqlite_errors_are_not_retryable() {
        let err = Error::UnknownOpType {
            id: 1,
            op_type: "x".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_malformed_entry());

        let err: Error = rusqlite::Error::InvalidParameterName("p".to_string()).into();
        assert!(matches!(err, Error::Sqlite(_)));
        assert!(err.to_string().contains("sqlite error"));
    }
}
