//! Error type for operation journal storage.
//!
//! Callers need to tell three situations apart: a row that does not exist
//! (`NotFound`), an update that would move a row backwards through its
//! lifecycle (`IllegalTransition`), and storage failures. Storage failures
//! split into `Transient` (retry-eligible: lock contention, I/O hiccups)
//! and `Corrupt` (fatal: the database file itself is damaged and further
//! writes must be refused).

use crate::models::OpStatus;

/// SQLite primary result codes that indicate a damaged database file.
/// SQLITE_CORRUPT = 11, SQLITE_NOTADB = 26.
const CORRUPT_CODES: &[&str] = &["11", "26"];

#[derive(Debug, thiserror::Error)]
pub enum OpLogError {
    #[error("operation {0} not found")]
    NotFound(i64),

    #[error("illegal status transition for operation {id}: {from} -> {to}")]
    IllegalTransition {
        id: i64,
        from: OpStatus,
        to: OpStatus,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient storage error")]
    Transient(#[source] sqlx::Error),

    #[error("operation log is corrupt: {0}")]
    Corrupt(String),
}

impl OpLogError {
    /// True if the caller may retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for OpLogError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if let Some(code) = db_err.code() {
                if CORRUPT_CODES.contains(&code.as_ref()) {
                    return Self::Corrupt(db_err.to_string());
                }
            }
        }
        Self::Transient(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_transient() {
        // `fetch_one` misses surface as sqlx::Error::RowNotFound; the query
        // layer translates those to NotFound explicitly, so the blanket
        // conversion treats them as transient.
        let err: OpLogError = sqlx::Error::RowNotFound.into();
        assert!(err.is_transient());
    }

    #[test]
    fn not_found_display_names_the_id() {
        let err = OpLogError::NotFound(42);
        assert_eq!(err.to_string(), "operation 42 not found");
    }

    #[test]
    fn illegal_transition_display() {
        let err = OpLogError::IllegalTransition {
            id: 7,
            from: OpStatus::Success,
            to: OpStatus::Inprogress,
        };
        let msg = err.to_string();
        assert!(msg.contains("operation 7"));
        assert!(msg.contains("success"));
        assert!(msg.contains("inprogress"));
    }
}
