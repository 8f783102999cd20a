//! `StrataDB` Index
//!
//! Secondary indexes for StrataDB, kept in a versioned copy-on-write
//! B-link-tree whose pages are themselves records in the underlying store.
//!
//! # How the tree lives in the store
//!
//! Every page is identified by a *logical* pointer. A pointer table maps
//! logical pointers to *physical* pointers (plus a CAS version); a node
//! table maps physical pointers to opaque page bytes. Mutating a page
//! means writing a fresh physical node and swinging the logical pointer
//! over with an optimistic compare-and-swap — a lost swap retries from the
//! root. Readers that raced a swap simply reload through the pointer
//! table.
//!
//! # Versioned entries
//!
//! Entries carry a validity upper bound: `u64::MAX` marks a live entry, a
//! finite version marks a tombstone written by the deleting transaction.
//! Iterators skip tombstones dead to their snapshot and feed the ones no
//! reader can see anymore to a cleaner, which erases them from the tree.
//!
//! # Modules
//!
//! - [`backend`] - The pointer-table/node-table adapter over two store tables
//! - [`keys`] - Unique and non-unique composite key shapes
//! - [`node`] - Page representation and codec
//! - [`tree`] - The tree itself
//! - [`cursor`] - Ordered cursors with tombstone GC

pub mod backend;
pub mod cursor;
pub mod error;
pub mod keys;
pub mod node;
pub mod tree;

pub use backend::{BdTreeBackend, IdAllocator, LogicalPtr, PhysicalPtr};
pub use cursor::{Direction, TreeCursor};
pub use error::{IndexError, IndexResult};
pub use keys::{EntryKey, NonUniqueKey, UniqueKey};
pub use tree::{BdTree, NonUniqueBdTree, UniqueBdTree};
