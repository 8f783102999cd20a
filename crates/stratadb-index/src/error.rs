//! Error types for the index crate.

use thiserror::Error;

use stratadb_store::StoreError;

/// Errors surfaced by tree operations.
///
/// The first three variants are the tree-level translations of store
/// errors (see [`crate::backend`] for the mapping table); the rest are
/// infrastructure failures.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A pointer or node that should exist was not found.
    #[error("tree object does not exist")]
    ObjectDoesntExist,

    /// A pointer or node was inserted over an existing one.
    #[error("tree object already exists")]
    ObjectExists,

    /// A compare-and-swap on the pointer table lost.
    #[error("wrong version on pointer swap")]
    WrongVersion,

    /// A page failed to decode.
    #[error("corrupt tree node: {0}")]
    CorruptNode(String),

    /// The pointer-id allocator failed.
    #[error("id allocation failed: {0}")]
    Allocation(String),

    /// The store failed in a way the tree cannot interpret.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
