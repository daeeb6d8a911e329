use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use genledger_core::{OwnerId, ReservationId};

use crate::ledger::LedgerError;

/// Per-owner token balance.
///
/// `available` is signed: a commit above the estimate settles the overage
/// here instead of re-reserving, which can overdraw the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    pub owner_id: OwnerId,
    pub available: i64,
    pub reserved: u64,
    pub consumed: u64,
    pub updated_at: DateTime<Utc>,
}

impl TokenAccount {
    pub fn open(owner_id: OwnerId, quota: u64, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            available: clamp_i64(quota),
            reserved: 0,
            consumed: 0,
            updated_at: now,
        }
    }

    pub fn credit(&mut self, tokens: u64, now: DateTime<Utc>) {
        self.available = self.available.saturating_add(clamp_i64(tokens));
        self.updated_at = now;
    }

    /// Move `tokens` from available to reserved.
    pub fn hold(&mut self, tokens: u64, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if clamp_i64(tokens) > self.available {
            return Err(LedgerError::InsufficientBalance {
                owner_id: self.owner_id,
                requested: tokens,
                available: self.available,
            });
        }
        self.available -= clamp_i64(tokens);
        self.reserved += tokens;
        self.updated_at = now;
        Ok(())
    }

    /// Close a hold of `estimated` tokens by charging `actual` tokens.
    pub fn settle_commit(&mut self, estimated: u64, actual: u64, now: DateTime<Utc>) {
        self.reserved = self.reserved.saturating_sub(estimated);
        self.consumed = self.consumed.saturating_add(actual);
        let delta = i128::from(estimated) - i128::from(actual);
        self.available = clamp_i128(i128::from(self.available) + delta);
        self.updated_at = now;
    }

    /// Close a hold of `estimated` tokens by returning all of them.
    pub fn settle_release(&mut self, estimated: u64, now: DateTime<Utc>) {
        self.reserved = self.reserved.saturating_sub(estimated);
        self.available = self.available.saturating_add(clamp_i64(estimated));
        self.updated_at = now;
    }
}

fn clamp_i64(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

fn clamp_i128(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Credit,
    Reserve,
    Commit,
    Release,
    Expire,
}

/// One balance mutation, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub owner_id: OwnerId,
    pub reservation_id: Option<ReservationId>,
    pub kind: LedgerEntryKind,
    pub tokens: u64,
    pub available_after: i64,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_then_commit_under_estimate_refunds_difference() {
        let now = Utc::now();
        let mut account = TokenAccount::open(OwnerId::new(), 1_000, now);

        account.hold(300, now).unwrap();
        assert_eq!(account.available, 700);
        assert_eq!(account.reserved, 300);

        account.settle_commit(300, 120, now);
        assert_eq!(account.available, 880);
        assert_eq!(account.reserved, 0);
        assert_eq!(account.consumed, 120);
    }

    #[test]
    fn commit_over_estimate_overdraws() {
        let now = Utc::now();
        let mut account = TokenAccount::open(OwnerId::new(), 100, now);

        account.hold(100, now).unwrap();
        account.settle_commit(100, 150, now);

        assert_eq!(account.available, -50);
        assert_eq!(account.consumed, 150);
    }

    #[test]
    fn hold_beyond_available_is_rejected_without_side_effects() {
        let now = Utc::now();
        let mut account = TokenAccount::open(OwnerId::new(), 50, now);

        let err = account.hold(51, now).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance { requested: 51, available: 50, .. }
        ));
        assert_eq!(account.available, 50);
        assert_eq!(account.reserved, 0);
    }
}
