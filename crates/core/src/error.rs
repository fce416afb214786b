//! Errors raised by the pure counting rules.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rejections that follow from the input and the current item state alone,
/// never from storage or the network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Bad user input: empty code, negative quantity, overlong name.
    #[error("validation failed: {0}")]
    Validation(String),

    /// State that should be impossible, such as a broken audit trail.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("session is closed")]
    SessionClosed,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
