//! Entity traits: identity plus the persisted view used for minimal updates.

use crate::state::PersistentState;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}

/// An entity whose changes are written back through a diff of its persisted fields.
///
/// `persistent_state()` must be deterministic: two calls without an intervening
/// mutation return equal snapshots.
pub trait Persistent: Entity {
    /// Snapshot of every field that takes part in update comparison.
    fn persistent_state(&self) -> PersistentState;

    /// Optimistic concurrency revision as last read from (or written to) the store.
    fn revision(&self) -> u64;
}
