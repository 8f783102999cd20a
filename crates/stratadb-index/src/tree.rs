//! The versioned copy-on-write B-link-tree.
//!
//! Pages never change in place. A mutation loads the target leaf, builds a
//! modified copy, writes it as a fresh physical node and swings the leaf's
//! logical pointer with a compare-and-swap against the version observed at
//! load time. Losing the swap invalidates the cached page and retries from
//! the root.
//!
//! Splits follow Lehman-Yao: the overflowing page is replaced by a left
//! half that carries a right link and high key to a freshly created right
//! sibling, which makes the tree navigable before the parent learns about
//! the split; the separator is then inserted one level up (growing a new
//! root when the tree gets taller). There is no merge on underflow —
//! erases leave pages sparse, and the pages a delete-heavy workload drains
//! stay behind as cheap small nodes.
//!
//! One `BdTree` instance belongs to one transaction: it carries the
//! transaction's snapshot and a private page cache keyed by logical
//! pointer. Cross-instance safety comes entirely from the pointer-table
//! CAS.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use stratadb_core::{FieldValue, RowKey};
use stratadb_store::Snapshot;

use crate::backend::{BdTreeBackend, LogicalPtr, PhysicalPtr, ROOT_LPTR};
use crate::cursor::TreeCursor;
use crate::error::{IndexError, IndexResult};
use crate::keys::{encode_key_fields, EntryKey, NonUniqueKey, UniqueKey};
use crate::node::{InnerNode, LeafNode, Node, MAX_INNER_CHILDREN, MAX_LEAF_ENTRIES};

/// A unique secondary index.
pub type UniqueBdTree = BdTree<UniqueKey>;

/// A non-unique secondary index.
pub type NonUniqueBdTree = BdTree<NonUniqueKey>;

/// A loaded page: its physical location, CAS version and decoded image.
#[derive(Clone)]
pub(crate) struct PageRef<K> {
    pub(crate) pptr: PhysicalPtr,
    pub(crate) version: u64,
    pub(crate) node: Arc<Node<K>>,
}

/// One transaction's view of a secondary index tree.
pub struct BdTree<K: EntryKey> {
    backend: BdTreeBackend,
    snapshot: Snapshot,
    cache: HashMap<u64, PageRef<K>>,
    /// Tombstones cursors found dead to every reader; erased by `sweep`.
    garbage: Arc<Mutex<Vec<K>>>,
}

impl<K: EntryKey> BdTree<K> {
    /// Opens an existing tree.
    #[must_use]
    pub fn open(backend: BdTreeBackend, snapshot: Snapshot) -> Self {
        Self {
            backend,
            snapshot,
            cache: HashMap::new(),
            garbage: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Opens a tree, initializing an empty root if none exists yet.
    pub fn create(backend: BdTreeBackend, snapshot: Snapshot) -> IndexResult<Self> {
        let tree = Self::open(backend, snapshot);
        let pptr = tree.backend.alloc_physical()?;
        tree.backend
            .insert_node(pptr, &Node::<K>::Leaf(LeafNode::empty()).encode())?;
        match tree.backend.insert_ptr(ROOT_LPTR, pptr) {
            Ok(()) => Ok(tree),
            Err(IndexError::ObjectExists) => {
                // Someone else initialized the tree first.
                tree.backend.remove_node(pptr).ok();
                Ok(tree)
            }
            Err(e) => Err(e),
        }
    }

    /// The snapshot this view is bound to.
    #[must_use]
    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub(crate) fn garbage_handle(&self) -> Arc<Mutex<Vec<K>>> {
        Arc::clone(&self.garbage)
    }

    // -----------------------------------------------------------------
    // Index-level operations
    // -----------------------------------------------------------------

    /// Inserts a live entry. Returns `false` if a live entry for the key
    /// already exists.
    pub fn insert(&mut self, fields: &[FieldValue], row: RowKey) -> IndexResult<bool> {
        let key = K::live(encode_key_fields(fields), row);
        self.map_insert(key, K::value_for(row))
    }

    /// Erases a live entry by tombstoning it at the snapshot's version and
    /// removing the live composite. Returns `false` if either step finds
    /// the tree in a conflicting state; the tombstone is compensated away
    /// in that case.
    pub fn erase(&mut self, fields: &[FieldValue], row: RowKey) -> IndexResult<bool> {
        let encoded = encode_key_fields(fields);
        let tombstone = K::tombstone(encoded.clone(), self.snapshot.version, row);
        let live = K::live(encoded, row);
        let value = K::value_for(row);
        if !self.map_insert(tombstone.clone(), value)? {
            return Ok(false);
        }
        if !self.map_erase(&live)? {
            // Undo the tombstone so the tree is exactly as before.
            self.map_erase(&tombstone)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Inverse of [`insert`](Self::insert), for transaction rollback.
    pub fn revert_insert(&mut self, fields: &[FieldValue], row: RowKey) -> IndexResult<()> {
        let live = K::live(encode_key_fields(fields), row);
        self.map_erase(&live)?;
        Ok(())
    }

    /// Inverse of [`erase`](Self::erase), for transaction rollback.
    pub fn revert_erase(&mut self, fields: &[FieldValue], row: RowKey) -> IndexResult<()> {
        let encoded = encode_key_fields(fields);
        let live = K::live(encoded.clone(), row);
        let tombstone = K::tombstone(encoded, self.snapshot.version, row);
        self.map_insert(live, K::value_for(row))?;
        self.map_erase(&tombstone)?;
        Ok(())
    }

    /// A forward cursor positioned at the first entry at or above the
    /// field list.
    pub fn lower_bound(&mut self, fields: &[FieldValue]) -> IndexResult<TreeCursor<K>> {
        let seek = K::seek_floor(encode_key_fields(fields));
        TreeCursor::seek_forward(self, &seek)
    }

    /// A backward cursor positioned at the greatest entry at or below the
    /// field list.
    pub fn reverse_lower_bound(&mut self, fields: &[FieldValue]) -> IndexResult<TreeCursor<K>> {
        let seek = K::seek_ceil(encode_key_fields(fields));
        TreeCursor::seek_backward(self, &seek)
    }

    /// Erases every tombstone the cursors of this view found dead to all
    /// readers.
    pub fn sweep(&mut self) -> IndexResult<()> {
        loop {
            let Some(key) = self.garbage.lock().pop() else {
                return Ok(());
            };
            self.map_erase(&key)?;
        }
    }

    // -----------------------------------------------------------------
    // Ordered-map layer
    // -----------------------------------------------------------------

    /// Inserts a composite, failing with `false` when it is present.
    pub(crate) fn map_insert(&mut self, key: K, value: u64) -> IndexResult<bool> {
        loop {
            let (lptr, page) = self.find_leaf(&key)?;
            let Node::Leaf(leaf) = &*page.node else {
                return Err(IndexError::CorruptNode("descent ended on inner page".into()));
            };
            match leaf.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(_) => return Ok(false),
                Err(pos) => {
                    let mut new = leaf.clone();
                    new.entries.insert(pos, (key.clone(), value));
                    if new.entries.len() <= MAX_LEAF_ENTRIES {
                        match self.swap(lptr, &page, Node::Leaf(new), true) {
                            Ok(()) => return Ok(true),
                            Err(IndexError::WrongVersion) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    match self.split_leaf(lptr, &page, new) {
                        Ok(()) => return Ok(true),
                        Err(IndexError::WrongVersion) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Removes an exact composite, returning whether it was present.
    pub(crate) fn map_erase(&mut self, key: &K) -> IndexResult<bool> {
        loop {
            let (lptr, page) = self.find_leaf(key)?;
            let Node::Leaf(leaf) = &*page.node else {
                return Err(IndexError::CorruptNode("descent ended on inner page".into()));
            };
            match leaf.entries.binary_search_by(|(k, _)| k.cmp(key)) {
                Err(_) => return Ok(false),
                Ok(pos) => {
                    let mut new = leaf.clone();
                    new.entries.remove(pos);
                    match self.swap(lptr, &page, Node::Leaf(new), true) {
                        Ok(()) => return Ok(true),
                        Err(IndexError::WrongVersion) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Page plumbing
    // -----------------------------------------------------------------

    /// Loads a page through the cache.
    pub(crate) fn load(&mut self, lptr: LogicalPtr) -> IndexResult<PageRef<K>> {
        if let Some(page) = self.cache.get(&lptr.0) {
            return Ok(page.clone());
        }
        loop {
            let (pptr, version) = self.backend.read_ptr(lptr)?;
            match self.backend.read_node(pptr) {
                Ok(bytes) => {
                    let node = Node::decode(&bytes)?;
                    let page = PageRef {
                        pptr,
                        version,
                        node: Arc::new(node),
                    };
                    self.cache.insert(lptr.0, page.clone());
                    return Ok(page);
                }
                // The node was reclaimed under us by a concurrent swap;
                // the pointer table has the fresh location.
                Err(IndexError::ObjectDoesntExist) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops a cached page so the next load refetches it.
    pub(crate) fn invalidate(&mut self, lptr: LogicalPtr) {
        self.cache.remove(&lptr.0);
    }

    /// Descends from the root to the leaf covering `key`, chasing right
    /// links across unfinished splits.
    pub(crate) fn find_leaf(&mut self, key: &K) -> IndexResult<(LogicalPtr, PageRef<K>)> {
        let mut lptr = ROOT_LPTR;
        loop {
            let page = self.load(lptr)?;
            if !page.node.covers(key) {
                let right = page.node.right().ok_or_else(|| {
                    IndexError::CorruptNode("page with high key but no right link".into())
                })?;
                // A stale cached image can mislead here; refresh it so the
                // chase terminates.
                self.invalidate(lptr);
                lptr = right;
                continue;
            }
            match &*page.node {
                Node::Leaf(_) => return Ok((lptr, page)),
                Node::Inner(inner) => {
                    lptr = inner.children[inner.child_for(key)];
                }
            }
        }
    }

    /// Writes `new` as a fresh physical node and swings `lptr` onto it.
    /// `reclaim` drops the old physical node on success.
    fn swap(
        &mut self,
        lptr: LogicalPtr,
        old: &PageRef<K>,
        new: Node<K>,
        reclaim: bool,
    ) -> IndexResult<()> {
        let pptr = self.backend.alloc_physical()?;
        self.backend.insert_node(pptr, &new.encode())?;
        match self.backend.update_ptr(lptr, pptr, old.version) {
            Ok(()) => {
                if reclaim {
                    // Best effort; a raced reader retries through the
                    // pointer table anyway.
                    self.backend.remove_node(old.pptr).ok();
                }
                self.cache.insert(
                    lptr.0,
                    PageRef {
                        pptr,
                        version: old.version + 1,
                        node: Arc::new(new),
                    },
                );
                Ok(())
            }
            Err(IndexError::WrongVersion) => {
                self.backend.remove_node(pptr).ok();
                self.invalidate(lptr);
                debug!(lptr = lptr.0, "lost page swap, retrying");
                Err(IndexError::WrongVersion)
            }
            Err(e) => Err(e),
        }
    }

    /// Splits an overflowing leaf image and publishes both halves.
    fn split_leaf(
        &mut self,
        lptr: LogicalPtr,
        old: &PageRef<K>,
        mut full: LeafNode<K>,
    ) -> IndexResult<()> {
        let mid = full.entries.len() / 2;
        let right_entries = full.entries.split_off(mid);
        let sep = right_entries[0].0.clone();
        let right_node = LeafNode {
            entries: right_entries,
            right: full.right,
            high_key: full.high_key.clone(),
        };
        let right_lptr = self.backend.alloc_logical()?;
        let right_pptr = self.backend.alloc_physical()?;
        self.backend
            .insert_node(right_pptr, &Node::Leaf(right_node).encode())?;
        self.backend.insert_ptr(right_lptr, right_pptr)?;

        let left = LeafNode {
            entries: full.entries,
            right: Some(right_lptr),
            high_key: Some(sep.clone()),
        };
        match self.swap(lptr, old, Node::Leaf(left), true) {
            Ok(()) => self.insert_separator(sep, right_lptr, 1),
            Err(e) => {
                // The sibling never became reachable; take it back out.
                self.backend.remove_ptr(right_lptr, u64::MAX).ok();
                self.backend.remove_node(right_pptr).ok();
                Err(e)
            }
        }
    }

    /// Inserts a separator for a freshly split child into the inner node
    /// at `target_level`, growing a new root when the tree gets taller.
    ///
    /// The split is already visible through the sibling's right link, so
    /// this is pure maintenance and retries until it lands.
    fn insert_separator(
        &mut self,
        sep: K,
        child: LogicalPtr,
        target_level: u16,
    ) -> IndexResult<()> {
        loop {
            self.invalidate(ROOT_LPTR);
            let root = self.load(ROOT_LPTR)?;
            if root.node.level() < target_level {
                // Grow: alias the current root under a fresh pointer and
                // put a new root above it.
                let alias = self.backend.alloc_logical()?;
                self.backend.insert_ptr(alias, root.pptr)?;
                let new_root = InnerNode {
                    level: target_level,
                    separators: vec![sep.clone()],
                    children: vec![alias, child],
                    right: None,
                    high_key: None,
                };
                // Keep the old physical node: the alias points at it now.
                match self.swap(ROOT_LPTR, &root, Node::Inner(new_root), false) {
                    Ok(()) => return Ok(()),
                    Err(IndexError::WrongVersion) => {
                        self.backend.remove_ptr(alias, u64::MAX).ok();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            // Walk down to the target level.
            let mut lptr = ROOT_LPTR;
            let mut page = root;
            loop {
                if !page.node.covers(&sep) {
                    let right = page.node.right().ok_or_else(|| {
                        IndexError::CorruptNode("page with high key but no right link".into())
                    })?;
                    self.invalidate(lptr);
                    lptr = right;
                    page = self.load(lptr)?;
                    continue;
                }
                if page.node.level() == target_level {
                    break;
                }
                let Node::Inner(inner) = &*page.node else {
                    return Err(IndexError::CorruptNode(
                        "reached leaf above target level".into(),
                    ));
                };
                lptr = inner.children[inner.child_for(&sep)];
                page = self.load(lptr)?;
            }

            let Node::Inner(inner) = &*page.node else {
                return Err(IndexError::CorruptNode("separator target is a leaf".into()));
            };
            if inner.separators.binary_search(&sep).is_ok() {
                // A retry after a swap we lost but a peer completed.
                return Ok(());
            }
            let idx = inner.child_for(&sep);
            let mut new = inner.clone();
            new.separators.insert(idx, sep.clone());
            new.children.insert(idx + 1, child);

            if new.children.len() <= MAX_INNER_CHILDREN {
                match self.swap(lptr, &page, Node::Inner(new), true) {
                    Ok(()) => return Ok(()),
                    Err(IndexError::WrongVersion) => continue,
                    Err(e) => return Err(e),
                }
            }

            // Split the inner node; the middle separator moves up.
            let mid = new.separators.len() / 2;
            let up_sep = new.separators[mid].clone();
            let right_seps = new.separators.split_off(mid + 1);
            new.separators.pop();
            let right_children = new.children.split_off(mid + 1);
            let right_node = InnerNode {
                level: target_level,
                separators: right_seps,
                children: right_children,
                right: new.right,
                high_key: new.high_key.clone(),
            };
            let right_lptr = self.backend.alloc_logical()?;
            let right_pptr = self.backend.alloc_physical()?;
            self.backend
                .insert_node(right_pptr, &Node::Inner(right_node).encode())?;
            self.backend.insert_ptr(right_lptr, right_pptr)?;
            new.right = Some(right_lptr);
            new.high_key = Some(up_sep.clone());
            match self.swap(lptr, &page, Node::Inner(new), true) {
                Ok(()) => return self.insert_separator(up_sep, right_lptr, target_level + 1),
                Err(IndexError::WrongVersion) => {
                    self.backend.remove_ptr(right_lptr, u64::MAX).ok();
                    self.backend.remove_node(right_pptr).ok();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::SeqAllocator;
    use stratadb_store::{MemoryStore, RecordStore, TransactionType};

    struct Fixture {
        store: Arc<dyn RecordStore>,
        /// Shared across tree views, like the remote counter is in
        /// production.
        alloc: Arc<SeqAllocator>,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(MemoryStore::new()),
            alloc: Arc::new(SeqAllocator::new()),
        }
    }

    impl Fixture {
        fn tree(&self, snapshot: Snapshot) -> UniqueBdTree {
            let (ptr, node) = match BdTreeBackend::open_tables(&self.store, "t") {
                Ok(t) => t,
                Err(_) => BdTreeBackend::create_tables(&self.store, "t").unwrap(),
            };
            let alloc: Arc<dyn crate::backend::IdAllocator> = self.alloc.clone();
            let backend = BdTreeBackend::new(Arc::clone(&self.store), ptr, node, alloc);
            BdTree::create(backend, snapshot).unwrap()
        }

        fn snapshot(&self) -> Snapshot {
            self.store
                .start_transaction(TransactionType::ReadWrite)
                .unwrap()
        }
    }

    fn fields(v: i32) -> Vec<FieldValue> {
        vec![FieldValue::Int(v)]
    }

    #[test]
    fn insert_and_scan_in_order() {
        let fx = fixture();
        let mut t = fx.tree(fx.snapshot());
        // Insert out of order, enough to split several times.
        for v in (0..500).rev() {
            assert!(t.insert(&fields(v), RowKey(v as u64)).unwrap());
        }
        let mut cursor = t.lower_bound(&fields(0)).unwrap();
        for expected in 0..500 {
            let (key, row) = cursor.next(&mut t).unwrap().expect("entry");
            assert_eq!(key, fields(expected));
            assert_eq!(row, RowKey(expected as u64));
        }
        assert!(cursor.next(&mut t).unwrap().is_none());
    }

    #[test]
    fn duplicate_live_insert_refused() {
        let fx = fixture();
        let mut t = fx.tree(fx.snapshot());
        assert!(t.insert(&fields(1), RowKey(10)).unwrap());
        // Same key, different row: unique index says no.
        assert!(!t.insert(&fields(1), RowKey(11)).unwrap());
    }

    #[test]
    fn lower_bound_starts_mid_range() {
        let fx = fixture();
        let mut t = fx.tree(fx.snapshot());
        for v in 0..200 {
            t.insert(&fields(v), RowKey(v as u64)).unwrap();
        }
        let mut cursor = t.lower_bound(&fields(132)).unwrap();
        for expected in 132..200 {
            let (key, row) = cursor.next(&mut t).unwrap().expect("entry");
            assert_eq!(key, fields(expected));
            assert_eq!(row, RowKey(expected as u64));
        }
        assert!(cursor.next(&mut t).unwrap().is_none());
    }

    #[test]
    fn erase_hides_entry_from_newer_snapshots() {
        let fx = fixture();
        let s1 = fx.snapshot();
        let mut t1 = fx.tree(s1);
        t1.insert(&fields(7), RowKey(7)).unwrap();
        fx.store.commit(&s1).unwrap();

        let mut t2 = fx.tree(fx.snapshot());
        assert!(t2.erase(&fields(7), RowKey(7)).unwrap());
        let mut cursor = t2.lower_bound(&fields(0)).unwrap();
        assert!(cursor.next(&mut t2).unwrap().is_none());
    }

    #[test]
    fn tombstoned_entry_stays_visible_to_older_snapshot() {
        let fx = fixture();
        let s1 = fx.snapshot();
        let mut t1 = fx.tree(s1);
        t1.insert(&fields(7), RowKey(7)).unwrap();
        fx.store.commit(&s1).unwrap();

        // The reader opens before the deleter's version.
        let reader_snap = fx.snapshot();
        let deleter_snap = fx.snapshot();
        let mut deleter = fx.tree(deleter_snap);
        deleter.erase(&fields(7), RowKey(7)).unwrap();

        let mut reader = fx.tree(reader_snap);
        let mut cursor = reader.lower_bound(&fields(0)).unwrap();
        let (key, row) = cursor.next(&mut reader).unwrap().expect("still visible");
        assert_eq!(key, fields(7));
        assert_eq!(row, RowKey(7));
    }

    #[test]
    fn revert_erase_restores_live_entry() {
        let fx = fixture();
        let mut t = fx.tree(fx.snapshot());
        t.insert(&fields(3), RowKey(3)).unwrap();
        assert!(t.erase(&fields(3), RowKey(3)).unwrap());
        t.revert_erase(&fields(3), RowKey(3)).unwrap();
        let mut cursor = t.lower_bound(&fields(3)).unwrap();
        let (key, row) = cursor.next(&mut t).unwrap().expect("restored");
        assert_eq!(key, fields(3));
        assert_eq!(row, RowKey(3));
    }

    #[test]
    fn erase_of_missing_entry_is_compensated() {
        let fx = fixture();
        let mut t = fx.tree(fx.snapshot());
        assert!(!t.erase(&fields(9), RowKey(9)).unwrap());
        // The compensation removed the tombstone again.
        let mut cursor = t.lower_bound(&fields(0)).unwrap();
        assert!(cursor.next(&mut t).unwrap().is_none());
    }

    #[test]
    fn reverse_scan_walks_down() {
        let fx = fixture();
        let mut t = fx.tree(fx.snapshot());
        for v in 0..300 {
            t.insert(&fields(v), RowKey(v as u64)).unwrap();
        }
        let mut cursor = t.reverse_lower_bound(&fields(149)).unwrap();
        for expected in (0..=149).rev() {
            let (key, _) = cursor.next(&mut t).unwrap().expect("entry");
            assert_eq!(key, fields(expected));
        }
        assert!(cursor.next(&mut t).unwrap().is_none());
    }

    #[test]
    fn two_views_race_on_one_page() {
        let fx = fixture();
        let mut a = fx.tree(fx.snapshot());
        let mut b = fx.tree(fx.snapshot());

        // Warm both caches on the same root page, then interleave writes;
        // each loser must retry through the pointer-table CAS.
        a.insert(&fields(1), RowKey(1)).unwrap();
        b.insert(&fields(2), RowKey(2)).unwrap();
        a.insert(&fields(3), RowKey(3)).unwrap();
        b.insert(&fields(4), RowKey(4)).unwrap();

        let mut cursor = a.lower_bound(&fields(0)).unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next(&mut a).unwrap() {
            seen.push(key[0].clone());
        }
        assert_eq!(
            seen,
            vec![
                FieldValue::Int(1),
                FieldValue::Int(2),
                FieldValue::Int(3),
                FieldValue::Int(4)
            ]
        );
    }

    #[test]
    fn dead_tombstones_are_swept() {
        let fx = fixture();
        let s1 = fx.snapshot();
        let mut t1 = fx.tree(s1);
        t1.insert(&fields(5), RowKey(5)).unwrap();
        t1.erase(&fields(5), RowKey(5)).unwrap();
        fx.store.commit(&s1).unwrap();

        // A later transaction: the tombstone's version is below every
        // active snapshot, so iteration queues it for the cleaner.
        let mut t2 = fx.tree(fx.snapshot());
        let mut cursor = t2.lower_bound(&fields(0)).unwrap();
        assert!(cursor.next(&mut t2).unwrap().is_none());
        drop(cursor);
        t2.sweep().unwrap();

        // The tombstone is physically gone: a raw probe finds no entry at
        // all anymore.
        let mut probe = t2.lower_bound(&fields(0)).unwrap();
        assert!(probe.raw_peek(&mut t2).unwrap().is_none());
    }
}
