//! Tree page representation and byte codec.
//!
//! Pages are immutable once written; every mutation builds a new page and
//! swings the logical pointer. The B-link invariant: a page with a `right`
//! link carries a `high_key`, and every key above the high key lives in or
//! right of the right sibling.

use crate::backend::LogicalPtr;
use crate::error::{IndexError, IndexResult};
use crate::keys::EntryKey;

/// Leaf pages split once they exceed this many entries.
pub const MAX_LEAF_ENTRIES: usize = 64;

/// Inner pages split once they exceed this many children.
pub const MAX_INNER_CHILDREN: usize = 64;

const KIND_LEAF: u8 = 0;
const KIND_INNER: u8 = 1;
const FLAG_RIGHT: u8 = 0b01;
const FLAG_HIGH_KEY: u8 = 0b10;

/// A leaf page: sorted `(composite, value)` entries.
#[derive(Debug, Clone)]
pub struct LeafNode<K> {
    /// Entries in ascending composite order.
    pub entries: Vec<(K, u64)>,
    /// Right sibling, if any.
    pub right: Option<LogicalPtr>,
    /// Upper bound of this page's key space; set iff `right` is.
    pub high_key: Option<K>,
}

impl<K> LeafNode<K> {
    /// An empty, rightmost leaf.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
            right: None,
            high_key: None,
        }
    }
}

/// An inner page: `children.len() - 1` separators.
///
/// Child `i` covers keys below `separators[i]`; keys at or above the last
/// separator go to the last child.
#[derive(Debug, Clone)]
pub struct InnerNode<K> {
    /// Height above the leaves; leaves are level 0.
    pub level: u16,
    /// Separator keys, ascending.
    pub separators: Vec<K>,
    /// Child logical pointers; one more than separators.
    pub children: Vec<LogicalPtr>,
    /// Right sibling, if any.
    pub right: Option<LogicalPtr>,
    /// Upper bound of this page's key space; set iff `right` is.
    pub high_key: Option<K>,
}

impl<K: EntryKey> InnerNode<K> {
    /// The child subtree a key belongs to.
    #[must_use]
    pub fn child_for(&self, key: &K) -> usize {
        self.separators.partition_point(|s| s <= key)
    }
}

/// One tree page.
#[derive(Debug, Clone)]
pub enum Node<K> {
    /// A leaf page.
    Leaf(LeafNode<K>),
    /// An inner page.
    Inner(InnerNode<K>),
}

impl<K: EntryKey> Node<K> {
    /// Whether a key may live under this page, or must chase the right
    /// link instead.
    #[must_use]
    pub fn covers(&self, key: &K) -> bool {
        match self.high_key() {
            Some(high) => key < high,
            None => true,
        }
    }

    /// The page's right link.
    #[must_use]
    pub fn right(&self) -> Option<LogicalPtr> {
        match self {
            Self::Leaf(l) => l.right,
            Self::Inner(i) => i.right,
        }
    }

    /// The page's high key.
    #[must_use]
    pub fn high_key(&self) -> Option<&K> {
        match self {
            Self::Leaf(l) => l.high_key.as_ref(),
            Self::Inner(i) => i.high_key.as_ref(),
        }
    }

    /// Height above the leaves.
    #[must_use]
    pub fn level(&self) -> u16 {
        match self {
            Self::Leaf(_) => 0,
            Self::Inner(i) => i.level,
        }
    }

    /// Serializes the page.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        match self {
            Self::Leaf(leaf) => {
                buf.push(KIND_LEAF);
                buf.push(flags(leaf.right.is_some(), leaf.high_key.is_some()));
                buf.extend_from_slice(&(leaf.entries.len() as u32).to_le_bytes());
                for (key, value) in &leaf.entries {
                    key.encode(&mut buf);
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                encode_links(&mut buf, leaf.right, leaf.high_key.as_ref());
            }
            Self::Inner(inner) => {
                buf.push(KIND_INNER);
                buf.push(flags(inner.right.is_some(), inner.high_key.is_some()));
                buf.extend_from_slice(&inner.level.to_le_bytes());
                buf.extend_from_slice(&(inner.children.len() as u32).to_le_bytes());
                for sep in &inner.separators {
                    sep.encode(&mut buf);
                }
                for child in &inner.children {
                    buf.extend_from_slice(&child.0.to_le_bytes());
                }
                encode_links(&mut buf, inner.right, inner.high_key.as_ref());
            }
        }
        buf
    }

    /// Deserializes a page.
    pub fn decode(data: &[u8]) -> IndexResult<Self> {
        let mut r = NodeReader { data, pos: 0 };
        let kind = r.u8()?;
        let flag_bits = r.u8()?;
        match kind {
            KIND_LEAF => {
                let count = r.u32()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = r.key::<K>()?;
                    let value = r.u64()?;
                    entries.push((key, value));
                }
                let (right, high_key) = r.links::<K>(flag_bits)?;
                Ok(Self::Leaf(LeafNode {
                    entries,
                    right,
                    high_key,
                }))
            }
            KIND_INNER => {
                let level = r.u16()?;
                let count = r.u32()? as usize;
                if count == 0 {
                    return Err(IndexError::CorruptNode("inner page without children".into()));
                }
                let mut separators = Vec::with_capacity(count - 1);
                for _ in 0..count - 1 {
                    separators.push(r.key::<K>()?);
                }
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    children.push(LogicalPtr(r.u64()?));
                }
                let (right, high_key) = r.links::<K>(flag_bits)?;
                Ok(Self::Inner(InnerNode {
                    level,
                    separators,
                    children,
                    right,
                    high_key,
                }))
            }
            other => Err(IndexError::CorruptNode(format!("unknown page kind {other}"))),
        }
    }
}

const fn flags(has_right: bool, has_high: bool) -> u8 {
    (if has_right { FLAG_RIGHT } else { 0 }) | (if has_high { FLAG_HIGH_KEY } else { 0 })
}

fn encode_links<K: EntryKey>(buf: &mut Vec<u8>, right: Option<LogicalPtr>, high_key: Option<&K>) {
    if let Some(right) = right {
        buf.extend_from_slice(&right.0.to_le_bytes());
    }
    if let Some(high) = high_key {
        high.encode(buf);
    }
}

struct NodeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl NodeReader<'_> {
    fn u8(&mut self) -> IndexResult<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| IndexError::CorruptNode("page truncated".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> IndexResult<u16> {
        let v = self
            .data
            .get(self.pos..self.pos + 2)
            .and_then(|s| s.try_into().ok())
            .map(u16::from_le_bytes)
            .ok_or_else(|| IndexError::CorruptNode("page truncated".into()))?;
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> IndexResult<u32> {
        let v = self
            .data
            .get(self.pos..self.pos + 4)
            .and_then(|s| s.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| IndexError::CorruptNode("page truncated".into()))?;
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> IndexResult<u64> {
        let v = self
            .data
            .get(self.pos..self.pos + 8)
            .and_then(|s| s.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| IndexError::CorruptNode("page truncated".into()))?;
        self.pos += 8;
        Ok(v)
    }

    fn key<K: EntryKey>(&mut self) -> IndexResult<K> {
        let (key, used) = K::decode(&self.data[self.pos..])?;
        self.pos += used;
        Ok(key)
    }

    fn links<K: EntryKey>(
        &mut self,
        flag_bits: u8,
    ) -> IndexResult<(Option<LogicalPtr>, Option<K>)> {
        let right = if flag_bits & FLAG_RIGHT != 0 {
            Some(LogicalPtr(self.u64()?))
        } else {
            None
        };
        let high_key = if flag_bits & FLAG_HIGH_KEY != 0 {
            Some(self.key::<K>()?)
        } else {
            None
        };
        Ok((right, high_key))
    }
}
