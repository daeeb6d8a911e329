//! In-memory ledger for tests, the simulator and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use genledger_core::{DomainError, IdempotencyKey, OwnerId, ReservationId};

use crate::account::{LedgerEntry, LedgerEntryKind, TokenAccount};
use crate::config::LedgerConfig;
use crate::ledger::{CommitResult, LedgerError, ReleaseResult, TokenLedger};
use crate::reservation::{Reservation, Transition};

type Slot<T> = Arc<Mutex<T>>;

/// Row-locked in-memory ledger.
///
/// Each reservation and each account sits behind its own mutex. Settlement
/// locks the reservation first, then the owner's account, then the journal;
/// the maps themselves are only held long enough to clone a slot.
#[derive(Debug, Default)]
pub struct InMemoryTokenLedger {
    config: LedgerConfig,
    accounts: RwLock<HashMap<OwnerId, Slot<TokenAccount>>>,
    reservations: RwLock<HashMap<ReservationId, Slot<Reservation>>>,
    journal: Mutex<Vec<LedgerEntry>>,
}

fn poisoned<T>(_: PoisonError<T>) -> LedgerError {
    LedgerError::Unavailable("ledger state poisoned".to_string())
}

impl InMemoryTokenLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn arc(config: LedgerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Open an account for `owner_id` with an initial quota.
    pub fn open_account(&self, owner_id: OwnerId, quota: u64) -> Result<TokenAccount, LedgerError> {
        let now = Utc::now();
        let account = TokenAccount::open(owner_id, quota, now);
        {
            let mut accounts = self.accounts.write().map_err(poisoned)?;
            if accounts.contains_key(&owner_id) {
                return Err(DomainError::validation(format!(
                    "account already open for owner {owner_id}"
                ))
                .into());
            }
            accounts.insert(owner_id, Arc::new(Mutex::new(account.clone())));
        }
        self.record(&account, None, LedgerEntryKind::Credit, quota, "account-opened", now)?;
        Ok(account)
    }

    /// Add tokens to an owner's available balance.
    pub fn credit(&self, owner_id: OwnerId, tokens: u64, reason: &str) -> Result<TokenAccount, LedgerError> {
        let slot = self.account_slot(owner_id)?;
        let mut account = slot.lock().map_err(poisoned)?;
        let now = Utc::now();
        account.credit(tokens, now);
        self.record(&account, None, LedgerEntryKind::Credit, tokens, reason, now)?;
        Ok(account.clone())
    }

    pub fn account(&self, owner_id: OwnerId) -> Result<Option<TokenAccount>, LedgerError> {
        let slot = self.accounts.read().map_err(poisoned)?.get(&owner_id).cloned();
        match slot {
            Some(slot) => Ok(Some(slot.lock().map_err(poisoned)?.clone())),
            None => Ok(None),
        }
    }

    /// Journal entries touching one reservation, oldest first.
    pub fn entries_for(&self, reservation_id: ReservationId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let journal = self.journal.lock().map_err(poisoned)?;
        Ok(journal
            .iter()
            .filter(|e| e.reservation_id == Some(reservation_id))
            .cloned()
            .collect())
    }

    pub fn journal(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.journal.lock().map_err(poisoned)?.clone())
    }

    /// Move every overdue ACTIVE reservation to EXPIRED and return its tokens.
    ///
    /// Safe to run next to late commits/releases: whichever transition takes
    /// the reservation lock first wins, the other sees `AlreadySettled`.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ReservationId>, LedgerError> {
        let slots: Vec<Slot<Reservation>> =
            self.reservations.read().map_err(poisoned)?.values().cloned().collect();

        let mut expired = Vec::new();
        for slot in slots {
            let mut reservation = slot.lock().map_err(poisoned)?;
            if !reservation.is_overdue(now) {
                continue;
            }
            let account_slot = self.account_slot(reservation.owner_id)?;
            let mut account = account_slot.lock().map_err(poisoned)?;

            reservation.expire(now);
            account.settle_release(reservation.estimated_tokens, now);
            self.record(
                &account,
                Some(reservation.id),
                LedgerEntryKind::Expire,
                reservation.estimated_tokens,
                "reservation-expired",
                now,
            )?;
            info!(
                reservation_id = %reservation.id,
                owner_id = %reservation.owner_id,
                tokens = reservation.estimated_tokens,
                "reservation expired"
            );
            expired.push(reservation.id);
        }
        Ok(expired)
    }

    fn account_slot(&self, owner_id: OwnerId) -> Result<Slot<TokenAccount>, LedgerError> {
        self.accounts
            .read()
            .map_err(poisoned)?
            .get(&owner_id)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(owner_id))
    }

    fn reservation_slot(&self, reservation_id: ReservationId) -> Result<Slot<Reservation>, LedgerError> {
        self.reservations
            .read()
            .map_err(poisoned)?
            .get(&reservation_id)
            .cloned()
            .ok_or(LedgerError::ReservationNotFound(reservation_id))
    }

    fn record(
        &self,
        account: &TokenAccount,
        reservation_id: Option<ReservationId>,
        kind: LedgerEntryKind,
        tokens: u64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut journal = self.journal.lock().map_err(poisoned)?;
        let sequence = journal.len() as u64 + 1;
        journal.push(LedgerEntry {
            sequence,
            owner_id: account.owner_id,
            reservation_id,
            kind,
            tokens,
            available_after: account.available,
            reason: reason.to_string(),
            recorded_at: at,
        });
        Ok(())
    }
}

impl TokenLedger for InMemoryTokenLedger {
    fn reserve(
        &self,
        owner_id: OwnerId,
        estimated_tokens: u64,
        reason: &str,
        correlation_id: &str,
    ) -> Result<Reservation, LedgerError> {
        if estimated_tokens == 0 {
            return Err(DomainError::validation("estimated tokens must be positive").into());
        }

        let account_slot = self.account_slot(owner_id)?;
        let now = Utc::now();
        let reservation = {
            let mut account = account_slot.lock().map_err(poisoned)?;
            account.hold(estimated_tokens, now)?;
            let reservation = Reservation::new(
                owner_id,
                estimated_tokens,
                reason,
                Some(correlation_id.to_string()),
                now,
                self.config.expires_at(now),
            );
            self.record(
                &account,
                Some(reservation.id),
                LedgerEntryKind::Reserve,
                estimated_tokens,
                reason,
                now,
            )?;
            reservation
        };

        self.reservations
            .write()
            .map_err(poisoned)?
            .insert(reservation.id, Arc::new(Mutex::new(reservation.clone())));

        info!(
            reservation_id = %reservation.id,
            owner_id = %owner_id,
            tokens = estimated_tokens,
            correlation_id,
            "tokens reserved"
        );
        Ok(reservation)
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
        actual_tokens: u64,
        reason: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<CommitResult, LedgerError> {
        let slot = self.reservation_slot(reservation_id)?;
        let mut reservation = slot.lock().map_err(poisoned)?;
        let account_slot = self.account_slot(reservation.owner_id)?;
        let now = Utc::now();

        match reservation.commit(actual_tokens, reason, idempotency_key, now)? {
            Transition::Replayed(result) => {
                debug!(%reservation_id, key = %idempotency_key, "commit replayed");
                Ok(result)
            }
            Transition::Applied(result) => {
                let mut account = account_slot.lock().map_err(poisoned)?;
                account.settle_commit(reservation.estimated_tokens, actual_tokens, now);
                self.record(
                    &account,
                    Some(reservation_id),
                    LedgerEntryKind::Commit,
                    actual_tokens,
                    reason,
                    now,
                )?;
                info!(
                    %reservation_id,
                    estimated = reservation.estimated_tokens,
                    actual = actual_tokens,
                    "reservation committed"
                );
                Ok(result)
            }
        }
    }

    fn release(
        &self,
        reservation_id: ReservationId,
        reason: &str,
        correlation_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<ReleaseResult, LedgerError> {
        let slot = self.reservation_slot(reservation_id)?;
        let mut reservation = slot.lock().map_err(poisoned)?;
        let account_slot = self.account_slot(reservation.owner_id)?;
        let now = Utc::now();

        match reservation.release(reason, correlation_id, idempotency_key, now)? {
            Transition::Replayed(result) => {
                debug!(%reservation_id, key = %idempotency_key, "release replayed");
                Ok(result)
            }
            Transition::Applied(result) => {
                let mut account = account_slot.lock().map_err(poisoned)?;
                account.settle_release(reservation.estimated_tokens, now);
                self.record(
                    &account,
                    Some(reservation_id),
                    LedgerEntryKind::Release,
                    reservation.estimated_tokens,
                    reason,
                    now,
                )?;
                info!(%reservation_id, reason, correlation_id, "reservation released");
                Ok(result)
            }
        }
    }

    fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>, LedgerError> {
        let slot = self.reservations.read().map_err(poisoned)?.get(&reservation_id).cloned();
        match slot {
            Some(slot) => Ok(Some(slot.lock().map_err(poisoned)?.clone())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::ReservationState;
    use genledger_core::ErrorKind;
    use proptest::prelude::*;
    use std::thread;

    fn ledger_with_account(quota: u64) -> (InMemoryTokenLedger, OwnerId) {
        let ledger = InMemoryTokenLedger::new(LedgerConfig::default());
        let owner = OwnerId::new();
        ledger.open_account(owner, quota).unwrap();
        (ledger, owner)
    }

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s)
    }

    fn available(ledger: &InMemoryTokenLedger, owner: OwnerId) -> i64 {
        ledger.account(owner).unwrap().unwrap().available
    }

    fn count(entries: &[LedgerEntry], kind: LedgerEntryKind) -> usize {
        entries.iter().filter(|e| e.kind == kind).count()
    }

    #[test]
    fn reserve_holds_tokens_and_sets_expiry() {
        let (ledger, owner) = ledger_with_account(1_000);
        let before = Utc::now();

        let r = ledger.reserve(owner, 400, "generation", "job-1").unwrap();

        assert_eq!(r.state, ReservationState::Active);
        assert_eq!(r.estimated_tokens, 400);
        assert!(r.expires_at >= before + chrono::Duration::minutes(30));
        let account = ledger.account(owner).unwrap().unwrap();
        assert_eq!(account.available, 600);
        assert_eq!(account.reserved, 400);
    }

    #[test]
    fn reserve_beyond_balance_fails() {
        let (ledger, owner) = ledger_with_account(100);

        let err = ledger.reserve(owner, 101, "generation", "job-1").unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(available(&ledger, owner), 100);
    }

    #[test]
    fn reserve_for_unknown_owner_is_not_found() {
        let ledger = InMemoryTokenLedger::default();
        let err = ledger.reserve(OwnerId::new(), 10, "generation", "job").unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
    }

    #[test]
    fn reserve_zero_tokens_is_rejected() {
        let (ledger, owner) = ledger_with_account(100);
        let err = ledger.reserve(owner, 0, "generation", "job").unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn opening_an_account_twice_is_rejected() {
        let (ledger, owner) = ledger_with_account(100);
        assert!(ledger.open_account(owner, 5).is_err());
        assert_eq!(available(&ledger, owner), 100);
    }

    #[test]
    fn credit_tops_up_available_and_journals_once() {
        let (ledger, owner) = ledger_with_account(100);
        ledger.reserve(owner, 60, "generation", "job-1").unwrap();
        let journal_before = ledger.journal().unwrap().len();

        let account = ledger.credit(owner, 250, "monthly-top-up").unwrap();

        assert_eq!(account.available, 290);
        assert_eq!(account.reserved, 60);
        assert_eq!(available(&ledger, owner), 290);

        let journal = ledger.journal().unwrap();
        assert_eq!(journal.len(), journal_before + 1);
        let entry = journal.last().unwrap();
        assert_eq!(entry.kind, LedgerEntryKind::Credit);
        assert_eq!(entry.tokens, 250);
        assert_eq!(entry.reason, "monthly-top-up");
        assert_eq!(entry.reservation_id, None);
        assert_eq!(entry.available_after, 290);
    }

    #[test]
    fn credit_for_unknown_owner_is_not_found() {
        let (ledger, _) = ledger_with_account(100);
        let journal_before = ledger.journal().unwrap().len();

        let err = ledger.credit(OwnerId::new(), 10, "top-up").unwrap_err();

        assert!(matches!(err, LedgerError::AccountNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(ledger.journal().unwrap().len(), journal_before);
    }

    #[test]
    fn commit_settles_difference_against_balance() {
        let (ledger, owner) = ledger_with_account(1_000);
        let r = ledger.reserve(owner, 400, "generation", "job-1").unwrap();

        let result = ledger.commit(r.id, 250, "generation-completed", &key("job-1:commit")).unwrap();

        assert_eq!(result.committed_tokens, 250);
        assert_eq!(result.state, ReservationState::Committed);
        let account = ledger.account(owner).unwrap().unwrap();
        assert_eq!(account.available, 750);
        assert_eq!(account.reserved, 0);
        assert_eq!(account.consumed, 250);

        let stored = ledger.reservation(r.id).unwrap().unwrap();
        assert_eq!(stored.committed_tokens, Some(250));
        assert_eq!(stored.estimated_tokens, 400);
    }

    #[test]
    fn commit_replay_moves_tokens_once() {
        let (ledger, owner) = ledger_with_account(1_000);
        let r = ledger.reserve(owner, 400, "generation", "job-1").unwrap();

        let first = ledger.commit(r.id, 250, "done", &key("job-1:commit")).unwrap();
        let second = ledger.commit(r.id, 250, "done", &key("job-1:commit")).unwrap();

        assert_eq!(first, second);
        assert_eq!(available(&ledger, owner), 750);
        assert_eq!(count(&ledger.entries_for(r.id).unwrap(), LedgerEntryKind::Commit), 1);
    }

    #[test]
    fn release_replay_moves_tokens_once() {
        let (ledger, owner) = ledger_with_account(1_000);
        let r = ledger.reserve(owner, 400, "generation", "job-1").unwrap();

        let first = ledger.release(r.id, "generation-failed", "job-1", &key("job-1:release")).unwrap();
        let second = ledger.release(r.id, "generation-failed", "job-1", &key("job-1:release")).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.released_tokens, 400);
        assert_eq!(available(&ledger, owner), 1_000);
        assert_eq!(count(&ledger.entries_for(r.id).unwrap(), LedgerEntryKind::Release), 1);
    }

    #[test]
    fn release_with_fresh_key_after_commit_is_already_settled() {
        let (ledger, owner) = ledger_with_account(1_000);
        let r = ledger.reserve(owner, 400, "generation", "job-1").unwrap();
        ledger.commit(r.id, 300, "done", &key("job-1:commit")).unwrap();
        let balance = available(&ledger, owner);

        let err = ledger.release(r.id, "late", "job-1", &key("fresh")).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::AlreadySettled { state: ReservationState::Committed, .. }
        ));
        assert_eq!(available(&ledger, owner), balance);
    }

    #[test]
    fn commit_after_release_is_already_settled() {
        let (ledger, owner) = ledger_with_account(1_000);
        let r = ledger.reserve(owner, 400, "generation", "job-1").unwrap();
        ledger.release(r.id, "cancel", "job-1", &key("job-1:release")).unwrap();

        let err = ledger.commit(r.id, 10, "late", &key("job-1:commit")).unwrap_err();

        assert_eq!(err.kind(), genledger_core::ErrorKind::AlreadySettled);
        assert_eq!(available(&ledger, owner), 1_000);
    }

    #[test]
    fn settling_unknown_reservation_is_not_found() {
        let ledger = InMemoryTokenLedger::default();
        let id = ReservationId::new();
        assert!(matches!(
            ledger.commit(id, 1, "x", &key("k")),
            Err(LedgerError::ReservationNotFound(found)) if found == id
        ));
        assert!(matches!(
            ledger.release(id, "x", "c", &key("k")),
            Err(LedgerError::ReservationNotFound(_))
        ));
    }

    #[test]
    fn expiry_sweep_returns_tokens_and_blocks_late_commit() {
        let (ledger, owner) = ledger_with_account(1_000);
        let r = ledger.reserve(owner, 400, "generation", "job-1").unwrap();

        assert!(ledger.expire_overdue(Utc::now()).unwrap().is_empty());
        let expired = ledger
            .expire_overdue(r.expires_at + chrono::Duration::seconds(1))
            .unwrap();

        assert_eq!(expired, vec![r.id]);
        assert_eq!(available(&ledger, owner), 1_000);
        let err = ledger.commit(r.id, 100, "late", &key("job-1:commit")).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::AlreadySettled { state: ReservationState::Expired, .. }
        ));
    }

    #[test]
    fn concurrent_commits_with_one_key_settle_once() {
        let (ledger, owner) = ledger_with_account(10_000);
        let ledger = Arc::new(ledger);
        let id = ledger.reserve(owner, 1_000, "generation", "job-1").unwrap().id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || ledger.commit(id, 600, "done", &key("job-1:commit")))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();

        assert!(results.iter().all(|res| res.committed_tokens == 600));
        assert_eq!(available(&ledger, owner), 9_400);
        assert_eq!(count(&ledger.entries_for(id).unwrap(), LedgerEntryKind::Commit), 1);
    }

    #[test]
    fn commit_racing_release_has_exactly_one_winner() {
        let (ledger, owner) = ledger_with_account(10_000);
        let ledger = Arc::new(ledger);
        let id = ledger.reserve(owner, 1_000, "generation", "job-1").unwrap().id;

        let committer = {
            let ledger = ledger.clone();
            thread::spawn(move || ledger.commit(id, 700, "done", &key("job-1:commit")).is_ok())
        };
        let releaser = {
            let ledger = ledger.clone();
            thread::spawn(move || {
                ledger.release(id, "reaper", "job-1", &key("job-1:release")).is_ok()
            })
        };
        let committed = committer.join().unwrap();
        let released = releaser.join().unwrap();

        assert!(committed ^ released);
        let entries = ledger.entries_for(id).unwrap();
        assert_eq!(
            count(&entries, LedgerEntryKind::Commit) + count(&entries, LedgerEntryKind::Release),
            1
        );
        let expected = if committed { 9_300 } else { 10_000 };
        assert_eq!(available(&ledger, owner), expected);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(u64),
        Commit(usize, u64),
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..500).prop_map(Op::Reserve),
            (0usize..16, 0u64..800).prop_map(|(i, t)| Op::Commit(i, t)),
            (0usize..16).prop_map(Op::Release),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: credited tokens are always accounted for as available,
        /// reserved or consumed, whatever sequence of settlements runs.
        #[test]
        fn balances_are_conserved(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let quota = 5_000u64;
            let (ledger, owner) = ledger_with_account(quota);
            let mut ids = Vec::new();

            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Reserve(t) => {
                        if let Ok(r) = ledger.reserve(owner, t, "generation", "prop") {
                            ids.push(r.id);
                        }
                    }
                    Op::Commit(i, t) if !ids.is_empty() => {
                        let id = ids[i % ids.len()];
                        let _ = ledger.commit(id, t, "prop", &key(&format!("c{n}")));
                    }
                    Op::Release(i) if !ids.is_empty() => {
                        let id = ids[i % ids.len()];
                        let _ = ledger.release(id, "prop", "prop", &key(&format!("r{n}")));
                    }
                    _ => {}
                }
            }

            let account = ledger.account(owner).unwrap().unwrap();
            let total = i128::from(account.available)
                + i128::from(account.reserved)
                + i128::from(account.consumed);
            prop_assert_eq!(total, i128::from(quota));

            for id in ids {
                let entries = ledger.entries_for(id).unwrap();
                let settlements = entries.iter().filter(|e| e.kind != LedgerEntryKind::Reserve).count();
                prop_assert!(settlements <= 1);
            }
        }
    }
}
