//! The per-table read cache and pending-change log.
//!
//! One `TableCache` exists per table touched by a transaction. It keeps
//! every tuple the transaction read (with whether the read saw the newest
//! version) and every change it staged, gives read-your-writes semantics
//! without network traffic, performs the local optimistic-conflict checks,
//! and dispatches the staged writes at commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use stratadb_core::{decode_tuple, encode_tuple, RowKey, Tuple};
use stratadb_store::{RecordStore, Snapshot, StoreError, TableInfo};

use crate::arena::{TupleArena, TupleRef};
use crate::error::{TransactionError, TxResult};
use crate::index_wrapper::IndexWrapper;

/// The kind of a staged change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// The key is new.
    Insert,
    /// The key exists and gets a new payload.
    Update,
    /// The key is removed; no payload.
    Delete,
}

/// One staged change.
#[derive(Debug, Clone, Copy)]
struct Change {
    tuple: Option<TupleRef>,
    op: ChangeOp,
    persisted: bool,
}

/// One transaction's cache over one table.
pub struct TableCache {
    info: TableInfo,
    store: Arc<dyn RecordStore>,
    snapshot: Snapshot,
    /// What we read: tuple plus whether the read saw the newest version.
    read_cache: HashMap<RowKey, (TupleRef, bool)>,
    /// What we staged, in key order so write-back and the undo log are
    /// deterministic.
    changes: BTreeMap<RowKey, Change>,
    indexes: HashMap<String, IndexWrapper>,
}

impl TableCache {
    pub(crate) fn new(
        info: TableInfo,
        store: Arc<dyn RecordStore>,
        snapshot: Snapshot,
        indexes: HashMap<String, IndexWrapper>,
    ) -> Self {
        Self {
            info,
            store,
            snapshot,
            read_cache: HashMap::new(),
            changes: BTreeMap::new(),
            indexes,
        }
    }

    /// The table this cache fronts.
    #[must_use]
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    /// Whether any change is staged.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty() || self.indexes.values().any(IndexWrapper::is_dirty)
    }

    /// The staged row keys, in order.
    pub(crate) fn changed_keys(&self) -> impl Iterator<Item = RowKey> + '_ {
        self.changes.keys().copied()
    }

    pub(crate) fn indexes(&self) -> &HashMap<String, IndexWrapper> {
        &self.indexes
    }

    pub(crate) fn index_mut(&mut self, name: &str) -> Option<&mut IndexWrapper> {
        self.indexes.get_mut(name)
    }

    /// Reads a tuple: staged change first, then the read cache, then the
    /// store at the snapshot.
    pub fn get(&mut self, arena: &mut TupleArena, key: RowKey) -> TxResult<TupleRef> {
        if let Some(change) = self.changes.get(&key) {
            return match change.tuple {
                Some(r) => Ok(r),
                None => Err(TransactionError::TupleDoesNotExist(key)),
            };
        }
        if let Some((r, _)) = self.read_cache.get(&key) {
            return Ok(*r);
        }
        let record = self
            .store
            .get(self.info.id, key.0, self.snapshot.version)?
            .ok_or(TransactionError::TupleDoesNotExist(key))?;
        let tuple = decode_tuple(Arc::clone(&self.info.schema), &record.data)?;
        let r = arena.alloc(tuple);
        self.read_cache.insert(key, (r, record.is_newest));
        Ok(r)
    }

    /// Stages an insert.
    ///
    /// A staged delete of the same key is promoted to an update with the
    /// new payload; an existing live or staged tuple is
    /// [`TransactionError::TupleExists`].
    pub fn insert(&mut self, arena: &mut TupleArena, key: RowKey, tuple: Tuple) -> TxResult<()> {
        let r = arena.alloc(tuple);
        let promoted = match self.changes.get_mut(&key) {
            Some(change) if change.op == ChangeOp::Delete => {
                change.tuple = Some(r);
                change.op = ChangeOp::Update;
                true
            }
            Some(_) => return Err(TransactionError::TupleExists(key)),
            None => false,
        };
        if !promoted {
            if self.read_cache.contains_key(&key) {
                return Err(TransactionError::TupleExists(key));
            }
            self.changes.insert(
                key,
                Change {
                    tuple: Some(r),
                    op: ChangeOp::Insert,
                    persisted: false,
                },
            );
        }
        // A key never sits in the read cache and the change log at once.
        self.read_cache.remove(&key);
        self.index_insert(key, arena.get(r));
        Ok(())
    }

    /// Stages an update of `key` from `from` to `to`.
    ///
    /// If the key was read through this cache and the read did not see
    /// the newest version, the conflict is raised here, before any
    /// network call.
    pub fn update(
        &mut self,
        arena: &mut TupleArena,
        key: RowKey,
        from: &Tuple,
        to: Tuple,
    ) -> TxResult<()> {
        let r = arena.alloc(to);
        let overwrote = match self.changes.get_mut(&key) {
            Some(change) if change.op == ChangeOp::Delete => {
                return Err(TransactionError::TupleDoesNotExist(key));
            }
            Some(change) => {
                change.tuple = Some(r);
                true
            }
            None => false,
        };
        if !overwrote {
            if let Some((_, is_newest)) = self.read_cache.get(&key) {
                if !is_newest {
                    debug!(key = key.0, "stale read, refusing update");
                    return Err(TransactionError::Conflict(key));
                }
            }
            self.changes.insert(
                key,
                Change {
                    tuple: Some(r),
                    op: ChangeOp::Update,
                    persisted: false,
                },
            );
        }
        self.read_cache.remove(&key);
        self.index_update(key, from, arena.get(r));
        Ok(())
    }

    /// Stages a delete. A staged insert simply evaporates.
    pub fn remove(&mut self, key: RowKey, tuple: &Tuple) -> TxResult<()> {
        enum Action {
            DropStagedInsert,
            Demoted,
            Fresh,
        }
        let action = match self.changes.get_mut(&key) {
            Some(change) if change.op == ChangeOp::Insert => Action::DropStagedInsert,
            Some(change) => {
                change.tuple = None;
                change.op = ChangeOp::Delete;
                Action::Demoted
            }
            None => Action::Fresh,
        };
        match action {
            Action::DropStagedInsert => {
                self.changes.remove(&key);
            }
            Action::Demoted => {}
            Action::Fresh => {
                if let Some((_, is_newest)) = self.read_cache.get(&key) {
                    if !is_newest {
                        return Err(TransactionError::Conflict(key));
                    }
                }
                self.changes.insert(
                    key,
                    Change {
                        tuple: None,
                        op: ChangeOp::Delete,
                        persisted: false,
                    },
                );
            }
        }
        self.read_cache.remove(&key);
        self.index_remove(key, tuple);
        Ok(())
    }

    /// Dispatches every staged change at the snapshot.
    ///
    /// Rejected writes are collected, not short-circuited, so one failed
    /// commit reports every conflicting key; successful writes are marked
    /// persisted for the rollback path.
    pub fn write_back(&mut self, arena: &TupleArena) -> TxResult<()> {
        let mut conflicts = Vec::new();
        for (key, change) in &mut self.changes {
            if change.persisted {
                continue;
            }
            let result = match change.op {
                ChangeOp::Insert => {
                    let tuple = arena.get(change.tuple.expect("insert carries a payload"));
                    let data = encode_tuple(tuple)?;
                    self.store
                        .insert(self.info.id, key.0, self.snapshot.version, &data)
                }
                ChangeOp::Update => {
                    let tuple = arena.get(change.tuple.expect("update carries a payload"));
                    let data = encode_tuple(tuple)?;
                    self.store
                        .update(self.info.id, key.0, self.snapshot.version, &data)
                }
                ChangeOp::Delete => {
                    self.store
                        .remove(self.info.id, key.0, self.snapshot.version)
                }
            };
            match result {
                Ok(()) => change.persisted = true,
                Err(StoreError::NotInSnapshot | StoreError::InvalidWrite) => {
                    conflicts.push(*key);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            debug!(table = %self.info.id, n = conflicts.len(), "write-back conflicts");
            Err(TransactionError::Conflicts(conflicts))
        }
    }

    /// Applies the staged index operations to the trees.
    pub fn write_indexes(&mut self) -> TxResult<()> {
        for wrapper in self.indexes.values_mut() {
            wrapper.write_back()?;
        }
        Ok(())
    }

    /// Reverts every persisted tuple write, newest key first.
    ///
    /// # Panics
    ///
    /// A revert the store refuses is an unrecoverable invariant violation:
    /// the undo log still references the write, so continuing would leak
    /// half a transaction.
    pub fn rollback(&mut self) {
        for (key, change) in self.changes.iter_mut().rev() {
            if !change.persisted {
                continue;
            }
            if let Err(e) = self.store.revert(self.info.id, key.0, self.snapshot.version) {
                panic!("revert of {key} failed during rollback: {e}");
            }
            change.persisted = false;
        }
    }

    /// Reverts every persisted index operation.
    pub fn rollback_indexes(&mut self) -> TxResult<()> {
        for wrapper in self.indexes.values_mut() {
            wrapper.undo()?;
        }
        Ok(())
    }

    fn index_insert(&mut self, key: RowKey, tuple: &Tuple) {
        for wrapper in self.indexes.values_mut() {
            wrapper.insert(key, tuple);
        }
    }

    fn index_update(&mut self, key: RowKey, old: &Tuple, new: &Tuple) {
        for wrapper in self.indexes.values_mut() {
            wrapper.update(key, old, new);
        }
    }

    fn index_remove(&mut self, key: RowKey, tuple: &Tuple) {
        for wrapper in self.indexes.values_mut() {
            wrapper.remove(key, tuple);
        }
    }
}
