//! Store infrastructure errors
//!
//! Rule violations are not errors at this layer: they come back as failed
//! [`StoreResponse`](crate::StoreResponse) codes. A `StoreError` means the
//! transaction could not run or commit at all.

use shardmap_common::{Error, ErrorCode};
use std::time::Duration;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction exceeded the command timeout of {limit:?} (ran {elapsed:?})")]
    Timeout { elapsed: Duration, limit: Duration },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl StoreError {
    /// Whether retrying the same transaction may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::Timeout { .. } => ErrorCode::StoreTimeout,
            StoreError::Unavailable(_) => ErrorCode::StoreUnreachable,
            StoreError::Bincode(_) => ErrorCode::Serialization,
            _ => ErrorCode::StorageFailure,
        };
        Self::new(code, e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
