//! Newtype ids used throughout StrataDB.

use serde::{Deserialize, Serialize};

/// Stable 64-bit id of a table in the record store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TableId(pub u64);

impl TableId {
    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for TableId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// Key of a row within a table. Keys are namespaced per table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RowKey(pub u64);

impl RowKey {
    /// Returns the raw key.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RowKey {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Position of a field within a schema.
///
/// Fields are numbered `0..n` with all fixed-size fields before all
/// variable-size fields, matching the serialized tuple layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct FieldId(pub u16);

impl FieldId {
    /// Returns the raw index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for FieldId {
    fn from(v: u16) -> Self {
        Self(v)
    }
}
