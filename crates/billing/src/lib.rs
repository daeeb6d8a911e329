//! Metered token ledger: reservations, owner accounts and the settlement journal.
//!
//! A reservation leaves ACTIVE exactly once, through `commit`, `release` or the
//! expiry sweep. Every balance mutation happens inside one of those transitions
//! while the reservation's own lock is held.

pub mod account;
pub mod config;
pub mod in_memory;
pub mod ledger;
pub mod reservation;

pub use account::{LedgerEntry, LedgerEntryKind, TokenAccount};
pub use config::LedgerConfig;
pub use in_memory::InMemoryTokenLedger;
pub use ledger::{CommitResult, LedgerError, ReleaseResult, TokenLedger};
pub use reservation::{Reservation, ReservationState, Settlement, Transition};
