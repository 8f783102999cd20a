//! Per-transaction index staging.
//!
//! An `IndexWrapper` buffers the index mutations a transaction implies —
//! inserts, deletes, and the delete/insert pairs an update of indexed
//! columns expands into — and merges that buffer with the backing tree
//! during iteration, so a transaction reads its own staged index writes.
//! The buffer flushes into the tree at commit ([`IndexWrapper::write_back`])
//! and already-flushed operations are compensated on rollback
//! ([`IndexWrapper::undo`]).

use std::collections::{BTreeMap, HashMap, VecDeque};

use stratadb_core::encoding::{decode_fields, encode_fields};
use stratadb_core::{FieldId, FieldValue, RowKey, Tuple};
use stratadb_index::{
    BdTree, BdTreeBackend, Direction, NonUniqueBdTree, TreeCursor, UniqueBdTree,
};
use stratadb_store::Snapshot;

use crate::error::{TransactionError, TxResult};

/// A staged index operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    /// Add a live entry.
    Insert,
    /// Tombstone a live entry.
    Delete,
}

#[derive(Debug, Clone)]
struct StagedOp {
    op: IndexOp,
    row: RowKey,
    persisted: bool,
}

/// The two tree flavours behind one wrapper.
enum IndexTree {
    Unique(UniqueBdTree),
    NonUnique(NonUniqueBdTree),
}

impl IndexTree {
    fn insert(&mut self, fields: &[FieldValue], row: RowKey) -> TxResult<bool> {
        Ok(match self {
            Self::Unique(t) => t.insert(fields, row)?,
            Self::NonUnique(t) => t.insert(fields, row)?,
        })
    }

    fn erase(&mut self, fields: &[FieldValue], row: RowKey) -> TxResult<bool> {
        Ok(match self {
            Self::Unique(t) => t.erase(fields, row)?,
            Self::NonUnique(t) => t.erase(fields, row)?,
        })
    }

    fn revert_insert(&mut self, fields: &[FieldValue], row: RowKey) -> TxResult<()> {
        match self {
            Self::Unique(t) => t.revert_insert(fields, row)?,
            Self::NonUnique(t) => t.revert_insert(fields, row)?,
        }
        Ok(())
    }

    fn revert_erase(&mut self, fields: &[FieldValue], row: RowKey) -> TxResult<()> {
        match self {
            Self::Unique(t) => t.revert_erase(fields, row)?,
            Self::NonUnique(t) => t.revert_erase(fields, row)?,
        }
        Ok(())
    }

    fn sweep(&mut self) {
        let _ = match self {
            Self::Unique(t) => t.sweep(),
            Self::NonUnique(t) => t.sweep(),
        };
    }
}

/// The two cursor flavours, forwarded by match.
enum CursorKind {
    Unique(TreeCursor<stratadb_index::UniqueKey>),
    NonUnique(TreeCursor<stratadb_index::NonUniqueKey>),
}

/// One transaction's view of one secondary index.
pub struct IndexWrapper {
    name: String,
    columns: Vec<FieldId>,
    tree: IndexTree,
    /// Multi-map: staged operations per encoded key, in staging order.
    staging: BTreeMap<Vec<u8>, Vec<StagedOp>>,
}

impl IndexWrapper {
    /// Opens a transaction's view of an index, creating the tree root
    /// when the index was just provisioned.
    pub(crate) fn open(
        name: String,
        unique: bool,
        columns: Vec<FieldId>,
        backend: BdTreeBackend,
        snapshot: Snapshot,
        create: bool,
    ) -> TxResult<Self> {
        let tree = match (unique, create) {
            (true, true) => IndexTree::Unique(BdTree::create(backend, snapshot)?),
            (true, false) => IndexTree::Unique(BdTree::open(backend, snapshot)),
            (false, true) => IndexTree::NonUnique(BdTree::create(backend, snapshot)?),
            (false, false) => IndexTree::NonUnique(BdTree::open(backend, snapshot)),
        };
        Ok(Self {
            name,
            columns,
            tree,
            staging: BTreeMap::new(),
        })
    }

    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The indexed key of a tuple.
    #[must_use]
    pub fn key_of(&self, tuple: &Tuple) -> Vec<FieldValue> {
        tuple.project(&self.columns)
    }

    /// Stages the index side of a row insert.
    pub fn insert(&mut self, row: RowKey, tuple: &Tuple) {
        self.stage(encode_fields(&self.key_of(tuple)), IndexOp::Insert, row);
    }

    /// Stages the index side of a row update. A no-op when the indexed
    /// columns did not change.
    pub fn update(&mut self, row: RowKey, old: &Tuple, new: &Tuple) {
        let old_key = encode_fields(&self.key_of(old));
        let new_key = encode_fields(&self.key_of(new));
        if old_key != new_key {
            self.stage(old_key, IndexOp::Delete, row);
            self.stage(new_key, IndexOp::Insert, row);
        }
    }

    /// Stages the index side of a row delete.
    pub fn remove(&mut self, row: RowKey, tuple: &Tuple) {
        self.stage(encode_fields(&self.key_of(tuple)), IndexOp::Delete, row);
    }

    fn stage(&mut self, key: Vec<u8>, op: IndexOp, row: RowKey) {
        self.staging.entry(key).or_default().push(StagedOp {
            op,
            row,
            persisted: false,
        });
    }

    /// Whether anything is staged.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.staging.is_empty()
    }

    /// The staged operations, for the undo log.
    pub(crate) fn staged(&self) -> impl Iterator<Item = (&'_ [u8], IndexOp, RowKey)> + '_ {
        self.staging.iter().flat_map(|(key, ops)| {
            ops.iter().map(move |op| (key.as_slice(), op.op, op.row))
        })
    }

    /// Applies the staged operations to the tree in multi-map order.
    ///
    /// A `false` return from the tree means a conflicting live entry;
    /// nothing further is marked persisted and the commit aborts with
    /// [`TransactionError::IndexConflict`].
    pub fn write_back(&mut self) -> TxResult<()> {
        for (key, ops) in &mut self.staging {
            let fields = decode_fields(key)?;
            for staged in ops.iter_mut() {
                if staged.persisted {
                    continue;
                }
                let applied = match staged.op {
                    IndexOp::Insert => self.tree.insert(&fields, staged.row)?,
                    IndexOp::Delete => self.tree.erase(&fields, staged.row)?,
                };
                if !applied {
                    return Err(TransactionError::IndexConflict {
                        row: staged.row,
                        index: self.name.clone(),
                    });
                }
                staged.persisted = true;
            }
        }
        Ok(())
    }

    /// Compensates every operation `write_back` already applied.
    pub fn undo(&mut self) -> TxResult<()> {
        for (key, ops) in &mut self.staging {
            let fields = decode_fields(key)?;
            for staged in ops.iter_mut() {
                if !staged.persisted {
                    continue;
                }
                match staged.op {
                    IndexOp::Insert => self.tree.revert_insert(&fields, staged.row)?,
                    IndexOp::Delete => self.tree.revert_erase(&fields, staged.row)?,
                }
                staged.persisted = false;
            }
        }
        Ok(())
    }

    /// A forward iterator from the first key at or above `key`, merged
    /// with the staged operations.
    pub fn lower_bound(&mut self, key: &[FieldValue]) -> TxResult<IndexIterator<'_>> {
        let seek = encode_fields(key);
        let staged = self.net_staged(&seek, Direction::Forward);
        let cursor = match &mut self.tree {
            IndexTree::Unique(t) => CursorKind::Unique(t.lower_bound(key)?),
            IndexTree::NonUnique(t) => CursorKind::NonUnique(t.lower_bound(key)?),
        };
        Ok(IndexIterator {
            tree: &mut self.tree,
            cursor,
            staged,
            peeked: None,
            direction: Direction::Forward,
        })
    }

    /// A backward iterator from the greatest key at or below `key`.
    pub fn reverse_lower_bound(&mut self, key: &[FieldValue]) -> TxResult<IndexIterator<'_>> {
        let seek = encode_fields(key);
        let staged = self.net_staged(&seek, Direction::Backward);
        let cursor = match &mut self.tree {
            IndexTree::Unique(t) => CursorKind::Unique(t.reverse_lower_bound(key)?),
            IndexTree::NonUnique(t) => CursorKind::NonUnique(t.reverse_lower_bound(key)?),
        };
        Ok(IndexIterator {
            tree: &mut self.tree,
            cursor,
            staged,
            peeked: None,
            direction: Direction::Backward,
        })
    }

    /// The net staged effect per `(key, row)` within the scanned range,
    /// ordered in scan direction. Later stagings win: an insert followed
    /// by a delete of the same entry nets out to the delete.
    fn net_staged(&self, seek: &[u8], direction: Direction) -> VecDeque<(Vec<u8>, IndexOp, RowKey)> {
        let mut out = Vec::new();
        let in_range: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<StagedOp>)>> = match direction {
            Direction::Forward => Box::new(self.staging.range(seek.to_vec()..)),
            Direction::Backward => Box::new(self.staging.range(..=seek.to_vec()).rev()),
        };
        for (key, ops) in in_range {
            let mut net: HashMap<RowKey, IndexOp> = HashMap::new();
            for staged in ops {
                net.insert(staged.row, staged.op);
            }
            let mut rows: Vec<_> = net.into_iter().collect();
            rows.sort_by_key(|(row, _)| row.0);
            if direction == Direction::Backward {
                rows.reverse();
            }
            for (row, op) in rows {
                out.push((key.clone(), op, row));
            }
        }
        out.into()
    }
}

/// An ordered iterator over one index, merging the tree with the
/// transaction's staged operations.
///
/// Yields `(key fields, row key)` pairs. Staged deletes suppress their
/// tree counterparts; staged inserts appear as if already flushed.
pub struct IndexIterator<'a> {
    tree: &'a mut IndexTree,
    cursor: CursorKind,
    staged: VecDeque<(Vec<u8>, IndexOp, RowKey)>,
    /// Tree-side lookahead: `(encoded key, fields, row)`.
    peeked: Option<(Vec<u8>, Vec<FieldValue>, RowKey)>,
    direction: Direction,
}

impl IndexIterator<'_> {
    /// The iteration direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The next visible `(key, row)` pair.
    pub fn next(&mut self) -> TxResult<Option<(Vec<FieldValue>, RowKey)>> {
        use std::cmp::Ordering;
        loop {
            if self.peeked.is_none() {
                self.peeked = match &mut self.cursor {
                    CursorKind::Unique(c) => match &mut *self.tree {
                        IndexTree::Unique(t) => c.next(t)?,
                        IndexTree::NonUnique(_) => unreachable!("cursor/tree flavour mismatch"),
                    },
                    CursorKind::NonUnique(c) => match &mut *self.tree {
                        IndexTree::NonUnique(t) => c.next(t)?,
                        IndexTree::Unique(_) => unreachable!("cursor/tree flavour mismatch"),
                    },
                }
                .map(|(fields, row)| (encode_fields(&fields), fields, row));
            }

            enum Pick {
                Done,
                Tree,
                Staged,
                Both,
            }
            let pick = match (&self.peeked, self.staged.front()) {
                (None, None) => Pick::Done,
                (Some(_), None) => Pick::Tree,
                (None, Some(_)) => Pick::Staged,
                (Some((tree_key, _, tree_row)), Some((staged_key, _, staged_row))) => {
                    let ord = match self.direction {
                        Direction::Forward => {
                            (tree_key, tree_row.0).cmp(&(staged_key, staged_row.0))
                        }
                        Direction::Backward => {
                            (staged_key, staged_row.0).cmp(&(tree_key, tree_row.0))
                        }
                    };
                    match ord {
                        Ordering::Less => Pick::Tree,
                        Ordering::Greater => Pick::Staged,
                        Ordering::Equal => Pick::Both,
                    }
                }
            };

            match pick {
                Pick::Done => return Ok(None),
                Pick::Tree => {
                    let (_, fields, row) = self.peeked.take().expect("picked tree");
                    return Ok(Some((fields, row)));
                }
                Pick::Staged => {
                    let (key, op, row) = self.staged.pop_front().expect("picked staged");
                    if op == IndexOp::Insert {
                        return Ok(Some((decode_fields(&key)?, row)));
                    }
                    // A staged delete with no tree counterpart; skip it.
                }
                Pick::Both => {
                    let (key, op, row) = self.staged.pop_front().expect("picked both");
                    self.peeked = None;
                    if op == IndexOp::Insert {
                        return Ok(Some((decode_fields(&key)?, row)));
                    }
                    // Staged delete suppresses the tree entry.
                }
            }
        }
    }
}

impl Drop for IndexIterator<'_> {
    fn drop(&mut self) {
        // Apply whatever the cursor's cleaner collected.
        self.tree.sweep();
    }
}
