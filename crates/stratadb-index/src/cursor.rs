//! Ordered tree cursors.
//!
//! A cursor buffers the entries of one leaf and refills lazily: forward
//! movement follows the B-link right chain, backward movement walks a
//! stack of page snapshots captured on the way down. A right-link chase
//! during a backward descent pushes the bypassed node as a pending
//! subtree, so entries left of an unfinished split are still visited in
//! order.
//!
//! Entries sharing one identity (same field list, and for non-unique
//! indexes the same row) sit adjacent; the cursor gathers each identity
//! group and yields at most one entry from it: the one with the smallest
//! validity bound still above the cursor's snapshot version. Tombstones at
//! or below the snapshot are skipped, and the ones below
//! `lowest_active_version` — dead to every possible reader — are handed to
//! the tree's cleaner for physical erasure in [`BdTree::sweep`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use stratadb_core::{FieldValue, RowKey};

use crate::backend::{LogicalPtr, ROOT_LPTR};
use crate::error::{IndexError, IndexResult};
use crate::keys::EntryKey;
use crate::node::Node;
use crate::tree::BdTree;

/// Direction of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order.
    Forward,
    /// Descending key order.
    Backward,
}

/// One element of the backward-descent stack.
#[derive(Clone)]
enum BackFrame<K> {
    /// An inner page being walked right-to-left. `entered` is false when
    /// the child at `idx` has not been visited yet (its slot was bypassed
    /// by a right-link chase).
    Inner {
        node: Arc<Node<K>>,
        idx: usize,
        entered: bool,
    },
    /// A subtree deferred by a right-link chase, pinned as the page image
    /// observed at the time (re-reading the pointer could hand back a
    /// grown root and replay entries already yielded).
    Pending(Arc<Node<K>>),
}

/// A cursor over one tree, bound to the tree's snapshot.
///
/// Cloning a cursor is cheap and shares the cleaner, so a clone's garbage
/// finds still end up in the originating tree's sweep.
#[derive(Clone)]
pub struct TreeCursor<K: EntryKey> {
    direction: Direction,
    /// Remaining entries of the current leaf, in scan order.
    buffer: VecDeque<(K, u64)>,
    /// Forward: the next leaf to pull from.
    next_leaf: Option<LogicalPtr>,
    /// Backward: subtrees still to visit, nearest last.
    stack: Vec<BackFrame<K>>,
    lookahead: Option<(K, u64)>,
    exhausted: bool,
    snapshot_version: u64,
    lowest_active: u64,
    cleaner: Arc<Mutex<Vec<K>>>,
}

impl<K: EntryKey> TreeCursor<K> {
    /// The cursor's direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn seek_forward(tree: &mut BdTree<K>, seek: &K) -> IndexResult<Self> {
        let snapshot = *tree.snapshot();
        let (_, page) = tree.find_leaf(seek)?;
        let Node::Leaf(leaf) = &*page.node else {
            return Err(IndexError::CorruptNode("descent ended on inner page".into()));
        };
        let pos = leaf.entries.partition_point(|(k, _)| k < seek);
        Ok(Self {
            direction: Direction::Forward,
            buffer: leaf.entries[pos..].iter().cloned().collect(),
            next_leaf: leaf.right,
            stack: Vec::new(),
            lookahead: None,
            exhausted: false,
            snapshot_version: snapshot.version,
            lowest_active: snapshot.lowest_active_version,
            cleaner: tree.garbage_handle(),
        })
    }

    pub(crate) fn seek_backward(tree: &mut BdTree<K>, seek: &K) -> IndexResult<Self> {
        let snapshot = *tree.snapshot();
        let mut stack: Vec<BackFrame<K>> = Vec::new();
        let mut lptr = ROOT_LPTR;
        let buffer = loop {
            let page = tree.load(lptr)?;
            if !page.node.covers(seek) {
                let right = page.node.right().ok_or_else(|| {
                    IndexError::CorruptNode("page with high key but no right link".into())
                })?;
                // Everything under the bypassed node is smaller than what
                // lies to the right; revisit it once the right side is
                // drained.
                stack.push(BackFrame::Pending(Arc::clone(&page.node)));
                tree.invalidate(lptr);
                lptr = right;
                continue;
            }
            match &*page.node {
                Node::Inner(inner) => {
                    let idx = inner.child_for(seek);
                    stack.push(BackFrame::Inner {
                        node: Arc::clone(&page.node),
                        idx,
                        entered: true,
                    });
                    lptr = inner.children[idx];
                }
                Node::Leaf(leaf) => {
                    let pos = leaf.entries.partition_point(|(k, _)| k <= seek);
                    break leaf.entries[..pos].iter().rev().cloned().collect();
                }
            }
        };
        let mut cursor = Self {
            direction: Direction::Backward,
            buffer,
            next_leaf: None,
            stack,
            lookahead: None,
            exhausted: false,
            snapshot_version: snapshot.version,
            lowest_active: snapshot.lowest_active_version,
            cleaner: tree.garbage_handle(),
        };
        if cursor.buffer.is_empty() {
            cursor.refill(tree)?;
        }
        Ok(cursor)
    }

    /// Yields the next visible `(fields, row)` pair, or `None` at the end.
    pub fn next(&mut self, tree: &mut BdTree<K>) -> IndexResult<Option<(Vec<FieldValue>, RowKey)>> {
        loop {
            let Some(first) = self.raw_next(tree)? else {
                return Ok(None);
            };
            let mut group = vec![first];
            loop {
                let same = match self.raw_peek(tree)? {
                    Some(peeked) => peeked.0.same_identity(&group[0].0),
                    None => false,
                };
                if !same {
                    break;
                }
                let entry = self.lookahead.take().expect("just peeked");
                group.push(entry);
            }

            let mut winner: Option<usize> = None;
            for (i, (key, _)) in group.iter().enumerate() {
                let validity = key.validity();
                if validity > self.snapshot_version {
                    // The entry was still live at our version; the
                    // earliest such bound is the one that applied to us.
                    let better = winner.map_or(true, |w| validity < group[w].0.validity());
                    if better {
                        winner = Some(i);
                    }
                } else if validity < self.lowest_active {
                    // Dead to every active reader.
                    self.cleaner.lock().push(key.clone());
                }
            }
            if let Some(i) = winner {
                let (key, value) = &group[i];
                let fields = key
                    .fields()
                    .map_err(|e| IndexError::CorruptNode(e.to_string()))?;
                return Ok(Some((fields, key.row(*value))));
            }
        }
    }

    /// Peeks the next raw entry, visibility unfiltered.
    pub(crate) fn raw_peek(&mut self, tree: &mut BdTree<K>) -> IndexResult<Option<&(K, u64)>> {
        if self.lookahead.is_none() {
            if self.buffer.is_empty() {
                self.refill(tree)?;
            }
            self.lookahead = self.buffer.pop_front();
        }
        Ok(self.lookahead.as_ref())
    }

    fn raw_next(&mut self, tree: &mut BdTree<K>) -> IndexResult<Option<(K, u64)>> {
        self.raw_peek(tree)?;
        Ok(self.lookahead.take())
    }

    fn refill(&mut self, tree: &mut BdTree<K>) -> IndexResult<()> {
        match self.direction {
            Direction::Forward => self.refill_forward(tree),
            Direction::Backward => self.refill_backward(tree),
        }
    }

    fn refill_forward(&mut self, tree: &mut BdTree<K>) -> IndexResult<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let Some(lptr) = self.next_leaf else {
                self.exhausted = true;
                break;
            };
            let page = tree.load(lptr)?;
            let Node::Leaf(leaf) = &*page.node else {
                return Err(IndexError::CorruptNode("right link led to inner page".into()));
            };
            self.buffer = leaf.entries.iter().cloned().collect();
            self.next_leaf = leaf.right;
        }
        Ok(())
    }

    fn refill_backward(&mut self, tree: &mut BdTree<K>) -> IndexResult<()> {
        while self.buffer.is_empty() && !self.exhausted {
            // Find the next subtree to the left.
            enum Descend<K> {
                Ptr(LogicalPtr),
                Image(Arc<Node<K>>),
            }
            let descend_from = loop {
                match self.stack.last_mut() {
                    None => {
                        self.exhausted = true;
                        return Ok(());
                    }
                    Some(BackFrame::Pending(node)) => {
                        let node = Arc::clone(node);
                        self.stack.pop();
                        break Descend::Image(node);
                    }
                    Some(BackFrame::Inner { node, idx, entered }) => {
                        if !*entered {
                            *entered = true;
                        } else if *idx == 0 {
                            self.stack.pop();
                            continue;
                        } else {
                            *idx -= 1;
                        }
                        let Node::Inner(inner) = &**node else {
                            return Err(IndexError::CorruptNode("leaf on cursor stack".into()));
                        };
                        break Descend::Ptr(inner.children[*idx]);
                    }
                }
            };
            match descend_from {
                Descend::Ptr(lptr) => self.descend_rightmost(tree, lptr)?,
                Descend::Image(node) => match &*node {
                    Node::Leaf(leaf) => {
                        self.buffer = leaf.entries.iter().rev().cloned().collect();
                    }
                    Node::Inner(inner) => {
                        let last = inner.children.len() - 1;
                        let child = inner.children[last];
                        self.stack.push(BackFrame::Inner {
                            node,
                            idx: last,
                            entered: true,
                        });
                        self.descend_rightmost(tree, child)?;
                    }
                },
            }
        }
        Ok(())
    }

    /// Descends to the rightmost leaf of a subtree, buffering its entries
    /// in reverse.
    fn descend_rightmost(&mut self, tree: &mut BdTree<K>, mut lptr: LogicalPtr) -> IndexResult<()> {
        loop {
            let page = tree.load(lptr)?;
            match &*page.node {
                Node::Inner(inner) => {
                    let last = inner.children.len() - 1;
                    self.stack.push(BackFrame::Inner {
                        node: Arc::clone(&page.node),
                        idx: last,
                        entered: true,
                    });
                    lptr = inner.children[last];
                }
                Node::Leaf(leaf) => {
                    self.buffer = leaf.entries.iter().rev().cloned().collect();
                    return Ok(());
                }
            }
        }
    }
}
