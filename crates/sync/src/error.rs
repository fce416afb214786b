use thiserror::Error;

use tally_core::DomainError;
use tally_infra::{ConnectionError, InfraError, StorageError};

/// Errors surfaced by the counting engine.
///
/// `VersionConflict` is retried inside the resolver and normally only shows
/// up in logs; callers see it only from operations that do not retry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CountError {
    /// Input rejected before any storage work happened.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("version conflict on item {code}: expected {expected}, found {actual:?}")]
    VersionConflict {
        code: String,
        expected: u64,
        actual: Option<u64>,
    },

    /// Retries exhausted, or a sync cycle could not talk to storage.
    ///
    /// For submissions, `quantity` carries the value that was not recorded.
    #[error("sync failed: {reason}")]
    FatalSync {
        reason: String,
        item_code: Option<String>,
        quantity: Option<f64>,
    },

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CountError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn fatal_sync(reason: impl Into<String>) -> Self {
        Self::FatalSync {
            reason: reason.into(),
            item_code: None,
            quantity: None,
        }
    }
}

impl From<DomainError> for CountError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => CountError::Validation(msg),
            other => CountError::Validation(other.to_string()),
        }
    }
}

impl From<StorageError> for CountError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict {
                code,
                expected,
                actual,
            } => CountError::VersionConflict {
                code,
                expected,
                actual,
            },
            StorageError::SessionClosed(id) => {
                CountError::Validation(format!("session {id} is closed"))
            }
            other => CountError::Storage(other),
        }
    }
}

impl From<InfraError> for CountError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::Connection(e) => e.into(),
            InfraError::Storage(e) => e.into(),
        }
    }
}

/// Rejected engine configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(String),

    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}
