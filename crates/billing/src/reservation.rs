use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use genledger_core::{Entity, IdempotencyKey, OwnerId, ReservationId, SettlementOperation};

use crate::ledger::{CommitResult, LedgerError, ReleaseResult};

/// Lifecycle of a reservation. Only `Active` accepts a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Active,
    Committed,
    Released,
    Expired,
}

impl ReservationState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ReservationState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Active => "active",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
            ReservationState::Expired => "expired",
        }
    }
}

impl core::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a reservation left ACTIVE. Recorded once, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// `None` for the expiry sweep, which is not a keyed operation.
    pub operation: Option<SettlementOperation>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub reason: String,
    pub correlation_id: Option<String>,
    /// Tokens charged (commit) or returned (release/expiry).
    pub tokens: u64,
    pub settled_at: DateTime<Utc>,
}

/// Ledger entry for a block of tokens held on behalf of an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub owner_id: OwnerId,
    pub state: ReservationState,
    pub estimated_tokens: u64,
    pub committed_tokens: Option<u64>,
    pub reason: String,
    pub correlation_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settlement: Option<Settlement>,
}

/// Outcome of a settlement attempt on a single reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<R> {
    /// The reservation moved out of ACTIVE; balances must be adjusted.
    Applied(R),
    /// Same operation and key as the original settlement; nothing changes.
    Replayed(R),
}

impl<R> Transition<R> {
    pub fn into_result(self) -> R {
        match self {
            Transition::Applied(r) | Transition::Replayed(r) => r,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Transition::Replayed(_))
    }
}

impl Reservation {
    pub fn new(
        owner_id: OwnerId,
        estimated_tokens: u64,
        reason: impl Into<String>,
        correlation_id: Option<String>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            owner_id,
            state: ReservationState::Active,
            estimated_tokens,
            committed_tokens: None,
            reason: reason.into(),
            correlation_id,
            expires_at,
            created_at: now,
            updated_at: now,
            settlement: None,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Active && self.expires_at <= now
    }

    fn settled_with(&self, operation: SettlementOperation, key: &IdempotencyKey) -> bool {
        self.settlement.as_ref().is_some_and(|s| {
            s.operation == Some(operation) && s.idempotency_key.as_ref() == Some(key)
        })
    }

    fn already_settled(&self) -> LedgerError {
        LedgerError::AlreadySettled {
            reservation_id: self.id,
            state: self.state,
        }
    }

    fn commit_result(&self) -> CommitResult {
        CommitResult {
            reservation_id: self.id,
            committed_tokens: self.committed_tokens.unwrap_or_default(),
            state: self.state,
        }
    }

    fn release_result(&self) -> ReleaseResult {
        ReleaseResult {
            reservation_id: self.id,
            released_tokens: self.estimated_tokens,
            state: self.state,
        }
    }

    /// ACTIVE → COMMITTED, or a replay of the original commit.
    pub fn commit(
        &mut self,
        actual_tokens: u64,
        reason: &str,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Transition<CommitResult>, LedgerError> {
        match self.state {
            ReservationState::Active => {
                self.state = ReservationState::Committed;
                self.committed_tokens = Some(actual_tokens);
                self.updated_at = now;
                self.settlement = Some(Settlement {
                    operation: Some(SettlementOperation::Commit),
                    idempotency_key: Some(key.clone()),
                    reason: reason.to_string(),
                    correlation_id: self.correlation_id.clone(),
                    tokens: actual_tokens,
                    settled_at: now,
                });
                Ok(Transition::Applied(self.commit_result()))
            }
            ReservationState::Committed if self.settled_with(SettlementOperation::Commit, key) => {
                Ok(Transition::Replayed(self.commit_result()))
            }
            _ => Err(self.already_settled()),
        }
    }

    /// ACTIVE → RELEASED, or a replay of the original release.
    pub fn release(
        &mut self,
        reason: &str,
        correlation_id: &str,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Transition<ReleaseResult>, LedgerError> {
        match self.state {
            ReservationState::Active => {
                self.state = ReservationState::Released;
                self.updated_at = now;
                self.settlement = Some(Settlement {
                    operation: Some(SettlementOperation::Release),
                    idempotency_key: Some(key.clone()),
                    reason: reason.to_string(),
                    correlation_id: Some(correlation_id.to_string()),
                    tokens: self.estimated_tokens,
                    settled_at: now,
                });
                Ok(Transition::Applied(self.release_result()))
            }
            ReservationState::Released if self.settled_with(SettlementOperation::Release, key) => {
                Ok(Transition::Replayed(self.release_result()))
            }
            _ => Err(self.already_settled()),
        }
    }

    /// ACTIVE → EXPIRED. Returns `false` if the reservation was not overdue.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_overdue(now) {
            return false;
        }
        self.state = ReservationState::Expired;
        self.updated_at = now;
        self.settlement = Some(Settlement {
            operation: None,
            idempotency_key: None,
            reason: "reservation-expired".to_string(),
            correlation_id: self.correlation_id.clone(),
            tokens: self.estimated_tokens,
            settled_at: now,
        });
        true
    }
}

impl Entity for Reservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
