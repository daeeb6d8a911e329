//! Domain error model and the cross-crate error taxonomy.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of a single entity (validation,
/// invariants, stale versions). Collaborator failures (ledger, store, principal
/// directory) have their own error types and classify into [`ErrorKind`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. mutating a terminal job).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stale version was written.
    #[error("conflict: {0}")]
    Conflict(String),
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

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_)
            | DomainError::InvariantViolation(_)
            | DomainError::InvalidId(_) => ErrorKind::Invalid,
            DomainError::Conflict(_) => ErrorKind::Conflict,
        }
    }
}

/// Classification shared by every error type in the workspace.
///
/// Callers branch on the kind rather than on concrete error enums: `NotFound`
/// and `Forbidden` go straight back to the requester, `Unavailable` and
/// `Inconsistent` need an operator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The entity does not exist.
    NotFound,
    /// The owner cannot cover a reservation.
    InsufficientBalance,
    /// Commit/release hit a reservation that is no longer active.
    AlreadySettled,
    /// Lock contention past its bound, or a stale write.
    Conflict,
    /// Duplicate or constraint failure at creation.
    IntegrityViolation,
    /// The acting principal may not perform the operation.
    Forbidden,
    /// A collaborator could not be reached.
    Unavailable,
    /// Input or state transition rejected by the domain.
    Invalid,
    /// A multi-collaborator unit of work stopped half way.
    Inconsistent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::AlreadySettled => "already_settled",
            ErrorKind::Conflict => "conflict",
            ErrorKind::IntegrityViolation => "integrity_violation",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Inconsistent => "inconsistent",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
