//! Ledger contract shared by every backend.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use genledger_core::{DomainError, ErrorKind, IdempotencyKey, OwnerId, ReservationId};

use crate::reservation::{Reservation, ReservationState};

/// Result of a commit (original or replayed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub reservation_id: ReservationId,
    pub committed_tokens: u64,
    pub state: ReservationState,
}

/// Result of a release (original or replayed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub reservation_id: ReservationId,
    pub released_tokens: u64,
    pub state: ReservationState,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("no token account for owner {0}")]
    AccountNotFound(OwnerId),

    #[error("insufficient balance for owner {owner_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        owner_id: OwnerId,
        requested: u64,
        available: i64,
    },

    #[error("reservation {reservation_id} already settled ({state})")]
    AlreadySettled {
        reservation_id: ReservationId,
        state: ReservationState,
    },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::ReservationNotFound(_) | LedgerError::AccountNotFound(_) => {
                ErrorKind::NotFound
            }
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::AlreadySettled { .. } => ErrorKind::AlreadySettled,
            LedgerError::Unavailable(_) => ErrorKind::Unavailable,
            LedgerError::Domain(e) => e.kind(),
        }
    }
}

/// Reservation ledger.
///
/// `commit` and `release` are the only ways out of ACTIVE. Both are idempotent
/// per key: repeating a call with the key of the original settlement returns
/// the original result and moves no tokens. Any other call on a settled
/// reservation fails with [`LedgerError::AlreadySettled`].
pub trait TokenLedger: Send + Sync {
    /// Hold `estimated_tokens` for `owner_id` until commit, release or expiry.
    fn reserve(
        &self,
        owner_id: OwnerId,
        estimated_tokens: u64,
        reason: &str,
        correlation_id: &str,
    ) -> Result<Reservation, LedgerError>;

    /// Charge `actual_tokens`; the difference to the estimate is settled
    /// against the owner's balance.
    fn commit(
        &self,
        reservation_id: ReservationId,
        actual_tokens: u64,
        reason: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<CommitResult, LedgerError>;

    /// Return the held tokens to the owner's available balance.
    fn release(
        &self,
        reservation_id: ReservationId,
        reason: &str,
        correlation_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<ReleaseResult, LedgerError>;

    /// Snapshot of a reservation.
    fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>, LedgerError>;
}

impl<L> TokenLedger for Arc<L>
where
    L: TokenLedger + ?Sized,
{
    fn reserve(
        &self,
        owner_id: OwnerId,
        estimated_tokens: u64,
        reason: &str,
        correlation_id: &str,
    ) -> Result<Reservation, LedgerError> {
        (**self).reserve(owner_id, estimated_tokens, reason, correlation_id)
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
        actual_tokens: u64,
        reason: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<CommitResult, LedgerError> {
        (**self).commit(reservation_id, actual_tokens, reason, idempotency_key)
    }

    fn release(
        &self,
        reservation_id: ReservationId,
        reason: &str,
        correlation_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<ReleaseResult, LedgerError> {
        (**self).release(reservation_id, reason, correlation_id, idempotency_key)
    }

    fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>, LedgerError> {
        (**self).reservation(reservation_id)
    }
}
