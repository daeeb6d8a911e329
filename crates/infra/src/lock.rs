//! Per-key exclusive locks ("select for update" without a database).
//!
//! [`RowLocks::acquire`] blocks until the key is free or the timeout elapses.
//! The returned [`RowGuard`] owns the lock; dropping it wakes one waiter.
//! Slots are created on demand and removed when nobody holds or awaits them.
//!
//! Lock order is always registry → slot. Waiting happens on the slot's
//! condvar with the registry released.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use genledger_core::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowLockError {
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    Timeout { key: String, waited: Duration },
}

impl RowLockError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Conflict
    }
}

#[derive(Debug, Default)]
struct SlotState {
    held: bool,
    waiters: usize,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    released: Condvar,
}

#[derive(Debug)]
struct Registry<K> {
    slots: Mutex<HashMap<K, Arc<Slot>>>,
}

// State behind these mutexes is a flag and a counter; a panic elsewhere
// cannot leave it half-written, so poisoning is ignored.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of per-key locks.
#[derive(Debug)]
pub struct RowLocks<K> {
    registry: Arc<Registry<K>>,
    timeout: Duration,
}

impl<K> Clone for RowLocks<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            timeout: self.timeout,
        }
    }
}

impl<K> RowLocks<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                slots: Mutex::new(HashMap::new()),
            }),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until `key` is exclusively held by the caller.
    pub fn acquire(&self, key: K) -> Result<RowGuard<K>, RowLockError> {
        let slot = {
            let mut slots = lock(&self.registry.slots);
            let slot = Arc::clone(slots.entry(key.clone()).or_default());
            // Registered as a waiter while the registry is held, so a
            // concurrent release cannot drop the slot from under us.
            lock(&slot.state).waiters += 1;
            slot
        };

        let state = lock(&slot.state);
        let (mut state, _) = slot
            .released
            .wait_timeout_while(state, self.timeout, |s| s.held)
            .unwrap_or_else(PoisonError::into_inner);
        state.waiters -= 1;

        if state.held {
            debug!(key = %key, timeout = ?self.timeout, "row lock wait timed out");
            return Err(RowLockError::Timeout {
                key: key.to_string(),
                waited: self.timeout,
            });
        }

        state.held = true;
        drop(state);

        Ok(RowGuard {
            registry: Arc::clone(&self.registry),
            slot,
            key,
        })
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        lock(&self.registry.slots).len()
    }
}

/// Exclusive hold on one key. Released on drop.
pub struct RowGuard<K>
where
    K: Eq + Hash,
{
    registry: Arc<Registry<K>>,
    slot: Arc<Slot>,
    key: K,
}

impl<K> RowGuard<K>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> fmt::Debug for RowGuard<K>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowGuard").field("key", &self.key).finish()
    }
}

impl<K> Drop for RowGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut slots = lock(&self.registry.slots);
        let mut state = lock(&self.slot.state);
        state.held = false;
        if state.waiters == 0 {
            slots.remove(&self.key);
        }
        drop(state);
        self.slot.released.notify_one();
    }
}
