//! The per-transaction tuple arena.
//!
//! Every tuple a transaction touches — decoded from the store, staged by
//! an insert or built by an update — lives here, referenced by stable
//! [`TupleRef`] handles from the caches. The whole arena drops with the
//! transaction, which is what makes the cache graph acyclic: caches point
//! into the arena with plain indices instead of owning (or raw-pointering
//! at) each other's tuples.

use stratadb_core::Tuple;

/// A stable handle into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleRef(usize);

/// Slab of tuples owned by one transaction.
#[derive(Debug, Default)]
pub struct TupleArena {
    slots: Vec<Tuple>,
}

impl TupleArena {
    /// An empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves a tuple into the arena.
    pub fn alloc(&mut self, tuple: Tuple) -> TupleRef {
        self.slots.push(tuple);
        TupleRef(self.slots.len() - 1)
    }

    /// The tuple behind a handle.
    ///
    /// # Panics
    ///
    /// Panics on a handle from a different arena; handles never outlive
    /// their transaction, so this is an internal invariant.
    #[must_use]
    pub fn get(&self, r: TupleRef) -> &Tuple {
        &self.slots[r.0]
    }

    /// Number of tuples held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
