//! The [`RecordStore`] trait: the versioned record API StrataDB consumes.

use std::sync::Arc;

use thiserror::Error;

use stratadb_core::{Schema, TableId};

use crate::scan::ScanKind;
use crate::snapshot::{Snapshot, TransactionType};

/// Version wildcard for removes on non-transactional tables.
///
/// The store reserves `u64::MAX` for "the live version", so a caller that
/// wants to remove a record regardless of its version passes `MAX - 2`.
pub const ANY_VERSION: u64 = u64::MAX - 2;

/// Errors surfaced by a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// The write is invalid: insert over a live record, or update/remove
    /// of an absent one.
    #[error("invalid write")]
    InvalidWrite,

    /// The write lost against a newer version (write-write conflict for
    /// transactional tables, CAS mismatch for non-transactional ones).
    #[error("record not in snapshot")]
    NotInSnapshot,

    /// No table with this name or id.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// A table with this name already exists.
    #[error("table '{0}' already exists")]
    TableExists(String),

    /// A scan exceeded its memory budget.
    #[error("scan result exceeds memory budget of {budget} bytes")]
    ScanMemoryExceeded {
        /// The budget that was exceeded.
        budget: usize,
    },

    /// A malformed payload or envelope reached the store.
    #[error("store decode error: {0}")]
    Decode(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A versioned record returned by [`RecordStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The record payload.
    pub data: Vec<u8>,
    /// Version of this record.
    pub version: u64,
    /// Whether this is the newest version of the record, i.e. whether the
    /// caller's snapshot saw the head of the version chain.
    pub is_newest: bool,
}

/// Handle to a table: id, name and schema.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Stable table id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// The table's schema.
    pub schema: Arc<Schema>,
}

/// A remote record store plus its commit manager.
///
/// All methods may suspend the calling fiber on a network round-trip; none
/// of them retain interior references to their arguments.
///
/// # Version parameters
///
/// For tables of kind [`TableKind::Transactional`](stratadb_core::TableKind)
/// the version arguments are snapshot versions: a write at version `v`
/// fails with [`StoreError::NotInSnapshot`] if a version newer than `v`
/// exists. For non-transactional tables they are explicit record versions:
/// `update` is a compare-and-swap against the exact current version, and
/// `remove` succeeds when the expected version is at least the current one
/// (which makes [`ANY_VERSION`] a wildcard).
pub trait RecordStore: Send + Sync {
    /// Creates a table, failing if the name is taken.
    fn create_table(&self, name: &str, schema: Schema) -> StoreResult<TableInfo>;

    /// Looks a table up by name.
    fn get_table(&self, name: &str) -> StoreResult<Option<TableInfo>>;

    /// Obtains a snapshot from the commit manager.
    fn start_transaction(&self, ty: TransactionType) -> StoreResult<Snapshot>;

    /// Releases a snapshot, committing whatever was written under it.
    fn commit(&self, snapshot: &Snapshot) -> StoreResult<()>;

    /// Reads the newest record version visible at `at_version`.
    ///
    /// Returns `Ok(None)` when the key has no visible live version. Pass
    /// `u64::MAX` to read the newest version unconditionally.
    fn get(&self, table: TableId, key: u64, at_version: u64) -> StoreResult<Option<Record>>;

    /// Inserts a record at the given version.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidWrite`] if a live record exists;
    /// [`StoreError::NotInSnapshot`] if a newer (even deleted) version
    /// exists in a transactional table.
    fn insert(&self, table: TableId, key: u64, version: u64, data: &[u8]) -> StoreResult<()>;

    /// Replaces a record, conditioned on `expected_version` (see the trait
    /// docs for the per-kind meaning).
    fn update(
        &self,
        table: TableId,
        key: u64,
        expected_version: u64,
        data: &[u8],
    ) -> StoreResult<()>;

    /// Deletes a record, conditioned on `expected_version`.
    fn remove(&self, table: TableId, key: u64, expected_version: u64) -> StoreResult<()>;

    /// Reverts every write the given version performed on the key.
    ///
    /// This is the rollback primitive: it undoes uncommitted writes made
    /// under a snapshot without touching older versions.
    fn revert(&self, table: TableId, key: u64, version: u64) -> StoreResult<()>;

    /// Runs a pushed-down scan at the snapshot.
    ///
    /// `selection` and `query` are the envelopes described in
    /// [`crate::scan`]; `memory` caps the total size of the returned
    /// records.
    fn scan(
        &self,
        table: TableId,
        snapshot: &Snapshot,
        memory: usize,
        kind: ScanKind,
        selection: &[u8],
        query: &[u8],
    ) -> StoreResult<Vec<Vec<u8>>>;
}

/// Allow shared ownership of a store without re-wrapping.
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    fn create_table(&self, name: &str, schema: Schema) -> StoreResult<TableInfo> {
        (**self).create_table(name, schema)
    }

    fn get_table(&self, name: &str) -> StoreResult<Option<TableInfo>> {
        (**self).get_table(name)
    }

    fn start_transaction(&self, ty: TransactionType) -> StoreResult<Snapshot> {
        (**self).start_transaction(ty)
    }

    fn commit(&self, snapshot: &Snapshot) -> StoreResult<()> {
        (**self).commit(snapshot)
    }

    fn get(&self, table: TableId, key: u64, at_version: u64) -> StoreResult<Option<Record>> {
        (**self).get(table, key, at_version)
    }

    fn insert(&self, table: TableId, key: u64, version: u64, data: &[u8]) -> StoreResult<()> {
        (**self).insert(table, key, version, data)
    }

    fn update(
        &self,
        table: TableId,
        key: u64,
        expected_version: u64,
        data: &[u8],
    ) -> StoreResult<()> {
        (**self).update(table, key, expected_version, data)
    }

    fn remove(&self, table: TableId, key: u64, expected_version: u64) -> StoreResult<()> {
        (**self).remove(table, key, expected_version)
    }

    fn revert(&self, table: TableId, key: u64, version: u64) -> StoreResult<()> {
        (**self).revert(table, key, version)
    }

    fn scan(
        &self,
        table: TableId,
        snapshot: &Snapshot,
        memory: usize,
        kind: ScanKind,
        selection: &[u8],
        query: &[u8],
    ) -> StoreResult<Vec<Vec<u8>>> {
        (**self).scan(table, snapshot, memory, kind, selection, query)
    }
}
