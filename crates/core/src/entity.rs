//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Generation jobs and ledger reservations are both entities: they keep their
/// identifier while status, counters and settlement state evolve.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
