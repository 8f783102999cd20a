//! Composite key shapes for the two index flavours.
//!
//! An index entry's composite is the indexed field list (in its
//! order-preserving byte encoding) plus a *validity upper bound*:
//! `u64::MAX` for live entries, the deleting transaction's version for
//! tombstones. Non-unique indexes additionally embed the row key in the
//! composite so the tree stays strictly ordered; unique indexes carry the
//! row key as the entry's value instead.

use stratadb_core::encoding::{decode_fields, encode_fields};
use stratadb_core::{CoreError, FieldValue, RowKey};

use crate::error::{IndexError, IndexResult};

/// Validity bound of a live entry.
pub const LIVE: u64 = u64::MAX;

/// A tree entry key: totally ordered, byte-encodable composite.
pub trait EntryKey: Ord + Clone + Send + std::fmt::Debug {
    /// Composite of a live entry.
    fn live(fields: Vec<u8>, row: RowKey) -> Self;

    /// Composite of a tombstone written at `version`.
    fn tombstone(fields: Vec<u8>, version: u64, row: RowKey) -> Self;

    /// Smallest composite with the given field bytes; seek target for
    /// forward lower bounds.
    fn seek_floor(fields: Vec<u8>) -> Self;

    /// Greatest composite with the given field bytes; seek target for
    /// reverse lower bounds.
    fn seek_ceil(fields: Vec<u8>) -> Self;

    /// The encoded field list.
    fn fields_bytes(&self) -> &[u8];

    /// The validity upper bound.
    fn validity(&self) -> u64;

    /// The row key this entry points at, given the entry's value.
    fn row(&self, value: u64) -> RowKey;

    /// The value stored alongside the composite: unique indexes carry the
    /// row key, non-unique indexes (row in the composite) a unit marker.
    fn value_for(row: RowKey) -> u64;

    /// Whether two composites denote the same logical entry, disregarding
    /// validity. Entries of one identity sit adjacent in the tree and at
    /// most one of them is yielded per scan position.
    fn same_identity(&self, other: &Self) -> bool;

    /// Decodes the field list back into values.
    fn fields(&self) -> Result<Vec<FieldValue>, CoreError> {
        decode_fields(self.fields_bytes())
    }

    /// Serializes the composite.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Deserializes a composite, returning it and the bytes consumed.
    fn decode(data: &[u8]) -> IndexResult<(Self, usize)>;
}

/// Builds the encoded field-list bytes for a composite.
#[must_use]
pub fn encode_key_fields(fields: &[FieldValue]) -> Vec<u8> {
    encode_fields(fields)
}

fn read_u32(data: &[u8], at: usize) -> IndexResult<u32> {
    data.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| IndexError::CorruptNode("truncated composite".into()))
}

fn read_u64(data: &[u8], at: usize) -> IndexResult<u64> {
    data.get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| IndexError::CorruptNode("truncated composite".into()))
}

/// Composite of a unique index: `(fields, validity)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UniqueKey {
    /// Order-preserving encoding of the indexed fields.
    pub fields: Vec<u8>,
    /// Validity upper bound.
    pub validity: u64,
}

impl EntryKey for UniqueKey {
    fn live(fields: Vec<u8>, _row: RowKey) -> Self {
        Self {
            fields,
            validity: LIVE,
        }
    }

    fn tombstone(fields: Vec<u8>, version: u64, _row: RowKey) -> Self {
        Self {
            fields,
            validity: version,
        }
    }

    fn seek_floor(fields: Vec<u8>) -> Self {
        Self {
            fields,
            validity: 0,
        }
    }

    fn seek_ceil(fields: Vec<u8>) -> Self {
        Self {
            fields,
            validity: LIVE,
        }
    }

    fn fields_bytes(&self) -> &[u8] {
        &self.fields
    }

    fn validity(&self) -> u64 {
        self.validity
    }

    fn row(&self, value: u64) -> RowKey {
        RowKey(value)
    }

    fn value_for(row: RowKey) -> u64 {
        row.0
    }

    fn same_identity(&self, other: &Self) -> bool {
        self.fields == other.fields
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.fields);
        buf.extend_from_slice(&self.validity.to_le_bytes());
    }

    fn decode(data: &[u8]) -> IndexResult<(Self, usize)> {
        let len = read_u32(data, 0)? as usize;
        let fields = data
            .get(4..4 + len)
            .ok_or_else(|| IndexError::CorruptNode("truncated composite".into()))?
            .to_vec();
        let validity = read_u64(data, 4 + len)?;
        Ok((Self { fields, validity }, 4 + len + 8))
    }
}

/// Composite of a non-unique index: `(fields, validity, row)`. The entry
/// value is unused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NonUniqueKey {
    /// Order-preserving encoding of the indexed fields.
    pub fields: Vec<u8>,
    /// Validity upper bound.
    pub validity: u64,
    /// The row this entry points at.
    pub row: RowKey,
}

impl EntryKey for NonUniqueKey {
    fn live(fields: Vec<u8>, row: RowKey) -> Self {
        Self {
            fields,
            validity: LIVE,
            row,
        }
    }

    fn tombstone(fields: Vec<u8>, version: u64, row: RowKey) -> Self {
        Self {
            fields,
            validity: version,
            row,
        }
    }

    fn seek_floor(fields: Vec<u8>) -> Self {
        Self {
            fields,
            validity: 0,
            row: RowKey(0),
        }
    }

    fn seek_ceil(fields: Vec<u8>) -> Self {
        Self {
            fields,
            validity: LIVE,
            row: RowKey(u64::MAX),
        }
    }

    fn fields_bytes(&self) -> &[u8] {
        &self.fields
    }

    fn validity(&self) -> u64 {
        self.validity
    }

    fn row(&self, _value: u64) -> RowKey {
        self.row
    }

    fn value_for(_row: RowKey) -> u64 {
        0
    }

    fn same_identity(&self, other: &Self) -> bool {
        self.fields == other.fields && self.row == other.row
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.fields);
        buf.extend_from_slice(&self.validity.to_le_bytes());
        buf.extend_from_slice(&self.row.0.to_le_bytes());
    }

    fn decode(data: &[u8]) -> IndexResult<(Self, usize)> {
        let len = read_u32(data, 0)? as usize;
        let fields = data
            .get(4..4 + len)
            .ok_or_else(|| IndexError::CorruptNode("truncated composite".into()))?
            .to_vec();
        let validity = read_u64(data, 4 + len)?;
        let row = RowKey(read_u64(data, 4 + len + 8)?);
        Ok((
            Self {
                fields,
                validity,
                row,
            },
            4 + len + 16,
        ))
    }
}
