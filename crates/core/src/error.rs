//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, illegal
/// transitions, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed audio reference).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The job state machine does not allow the requested transition.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// An identifier or enum value could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A conflict occurred (stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn illegal_transition(from: impl core::fmt::Display, to: impl core::fmt::Display) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
