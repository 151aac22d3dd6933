//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (bad identifiers, malformed wire payloads,
/// programmer errors). Storage and transport concerns belong in the infra
/// crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An operation needed a persisted job but got one without identity.
    #[error("job has not been persisted")]
    UnpersistedJob,

    /// A broker payload could not be decoded as a notification.
    #[error("malformed notification: {0}")]
    MalformedNotification(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedNotification(msg.into())
    }
}
