use std::time::Duration;

use thiserror::Error;

/// Storage operation error.
///
/// These are **infrastructure errors** (persistence, concurrency) as opposed
/// to domain errors (validation, invariants).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The conditional item update matched no row at the expected version.
    #[error("version conflict on item {code}: expected {expected}, found {actual:?}")]
    VersionConflict {
        code: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write (team name, item code).
    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("session {0} is closed")]
    SessionClosed(i64),

    /// A persisted row could not be decoded into a domain value.
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    /// Any other backend failure (IO, lost connection, driver error).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failure to obtain a pooled storage connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("timed out after {0:?} waiting for a storage connection")]
    Timeout(Duration),

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to open storage connection: {0}")]
    Connect(String),
}

/// Either half of an infra call that first acquires a connection and then uses it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfraError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
