//! Undo-log byte format.
//!
//! The undo log names everything a transaction wrote before it committed,
//! so a crashed client's writes can be reverted by whoever finds the log.
//! Layout, all little-endian:
//!
//! ```text
//! u32 table_count
//! per table:
//!   u64 table_id | u32 change_count | [u64 row_key]*
//!   u32 index_count
//!   per index:
//!     u32 name_len | name bytes
//!     u32 op_count | [u32 key_len | key | u8 op | u64 row_key]*
//! ```
//!
//! The log is persisted in the client's `__transactions_<id>` table under
//! `snapshot.version << 16 | chunk_index`, sliced into 16 KiB chunks.
//! [`replay`] reverts the tuple writes; it is idempotent, since reverting
//! an already-reverted version is a no-op in the store. Index sections
//! are informational for a recovery agent — live transactions compensate
//! their index writes in memory instead.

use stratadb_core::{RowKey, TableId};
use stratadb_store::RecordStore;

use crate::error::{TransactionError, TxResult};
use crate::index_wrapper::IndexOp;

/// Size of one undo-log chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Bits of the undo-log key reserved for the chunk index.
pub const CHUNK_BITS: u32 = 16;

/// The key of one undo-log chunk.
#[must_use]
pub const fn chunk_key(version: u64, chunk: u16) -> u64 {
    (version << CHUNK_BITS) | chunk as u64
}

/// One table's section of a decoded undo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoLogTable {
    /// The table that was written.
    pub table: TableId,
    /// Every staged row key.
    pub keys: Vec<RowKey>,
    /// The index sections, when the log was written with indexes.
    pub indexes: Vec<UndoLogIndex>,
}

/// One index's section of a decoded undo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoLogIndex {
    /// The index name.
    pub name: String,
    /// Staged operations: `(encoded key, op, row)`.
    pub ops: Vec<(Vec<u8>, IndexOp, RowKey)>,
}

/// Decodes an undo log produced by
/// [`TransactionCache::undo_log`](crate::tx_cache::TransactionCache::undo_log).
pub fn decode(data: &[u8]) -> TxResult<Vec<UndoLogTable>> {
    let mut r = Reader { data, pos: 0 };
    let table_count = r.u32()?;
    let mut tables = Vec::with_capacity(table_count as usize);
    for _ in 0..table_count {
        let table = TableId(r.u64()?);
        let change_count = r.u32()?;
        let mut keys = Vec::with_capacity(change_count as usize);
        for _ in 0..change_count {
            keys.push(RowKey(r.u64()?));
        }
        let index_count = r.u32()?;
        let mut indexes = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let name_len = r.u32()? as usize;
            let name = String::from_utf8(r.bytes(name_len)?.to_vec())
                .map_err(|e| corrupt(format!("index name: {e}")))?;
            let op_count = r.u32()?;
            let mut ops = Vec::with_capacity(op_count as usize);
            for _ in 0..op_count {
                let key_len = r.u32()? as usize;
                let key = r.bytes(key_len)?.to_vec();
                let op = match r.u8()? {
                    0 => IndexOp::Insert,
                    1 => IndexOp::Delete,
                    other => return Err(corrupt(format!("index op {other}"))),
                };
                let row = RowKey(r.u64()?);
                ops.push((key, op, row));
            }
            indexes.push(UndoLogIndex { name, ops });
        }
        tables.push(UndoLogTable {
            table,
            keys,
            indexes,
        });
    }
    Ok(tables)
}

/// Reverts every tuple write the log records, at the writing version.
///
/// Replaying twice is equivalent to replaying once.
pub fn replay(
    store: &dyn RecordStore,
    log: &[UndoLogTable],
    version: u64,
) -> TxResult<()> {
    for section in log {
        for key in &section.keys {
            store.revert(section.table, key.0, version)?;
        }
    }
    Ok(())
}

fn corrupt(msg: String) -> TransactionError {
    TransactionError::Codec(stratadb_core::CoreError::Decode(format!(
        "undo log: {msg}"
    )))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> TxResult<&'a [u8]> {
        let s = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| corrupt("truncated".into()))?;
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> TxResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> TxResult<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().expect("len")))
    }

    fn u64(&mut self) -> TxResult<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().expect("len")))
    }
}
