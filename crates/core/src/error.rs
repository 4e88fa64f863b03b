//! Errors raised by pure domain rules.
//!
//! All of these are deterministic: retrying the same input gives the same
//! error, so callers reject rather than retry.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Submission rejected before anything is written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Text that does not parse as a job or user id.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("stage out of range: {0} (expected 0..=5)")]
    StageOutOfRange(i64),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Whether the error came from user input (as opposed to stored data).
    pub fn is_validation(&self) -> bool {
        matches!(self, DomainError::Validation(_))
    }
}
