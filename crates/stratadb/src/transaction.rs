//! The transaction: StrataDB's public surface.
//!
//! A `Transaction` owns a snapshot from the commit manager, a tuple
//! arena, and the caches that make reads and writes local until commit.
//! `commit` persists the undo log, drains the staged tuple writes, then
//! the staged index writes, drops the undo log and releases the snapshot;
//! any failure unwinds the same steps in reverse. Dropping an uncommitted
//! transaction rolls it back.

use std::sync::Arc;

use tracing::{debug, warn};

use stratadb_core::{FieldValue, RowKey, Schema, TableId, Tuple};
use stratadb_store::{RecordStore, Snapshot, TransactionType, ANY_VERSION};

use crate::arena::TupleArena;
use crate::context::ClientContext;
use crate::counter::RemoteCounter;
use crate::error::{TransactionError, TxResult};
use crate::index_wrapper::IndexIterator;
use crate::scan::{ScanQuery, ScanResult};
use crate::tx_cache::TransactionCache;
use crate::undo_log::{chunk_key, CHUNK_SIZE};

/// One ACID transaction against the record store.
pub struct Transaction {
    store: Arc<dyn RecordStore>,
    context: Arc<ClientContext>,
    snapshot: Snapshot,
    ty: TransactionType,
    arena: TupleArena,
    cache: TransactionCache,
    /// Undo-log chunks written so far, for cleanup on both paths.
    log_chunks: u16,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        context: Arc<ClientContext>,
        snapshot: Snapshot,
        ty: TransactionType,
    ) -> Self {
        let cache = TransactionCache::new(Arc::clone(&store), Arc::clone(&context), snapshot);
        Self {
            store,
            context,
            snapshot,
            ty,
            arena: TupleArena::new(),
            cache,
            log_chunks: 0,
            finished: false,
        }
    }

    /// The snapshot this transaction runs under.
    #[must_use]
    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The transaction type.
    #[must_use]
    pub const fn transaction_type(&self) -> TransactionType {
        self.ty
    }

    // -----------------------------------------------------------------
    // Tables
    // -----------------------------------------------------------------

    /// Opens a table, returning its id. The schema is cached
    /// process-wide, so repeated opens cost no round-trip.
    pub fn open_table(&mut self, name: &str) -> TxResult<TableId> {
        self.cache.open_table(name)
    }

    /// Creates a table, provisioning its indexes' backing tables.
    pub fn create_table(&mut self, name: &str, schema: Schema) -> TxResult<TableId> {
        self.cache.create_table(name, schema)
    }

    /// The schema of an opened table.
    pub fn schema(&self, table: TableId) -> TxResult<Arc<Schema>> {
        Ok(Arc::clone(&self.cache.table(table)?.info().schema))
    }

    // -----------------------------------------------------------------
    // Reads and writes
    // -----------------------------------------------------------------

    /// Reads a tuple at the snapshot, serving staged writes first
    /// (read-your-writes).
    pub fn get(&mut self, table: TableId, key: RowKey) -> TxResult<&Tuple> {
        let r = self.cache.table_mut(table)?.get(&mut self.arena, key)?;
        Ok(self.arena.get(r))
    }

    /// Stages an insert of a new tuple under `key`.
    pub fn insert(&mut self, table: TableId, key: RowKey, tuple: Tuple) -> TxResult<()> {
        self.cache
            .table_mut(table)?
            .insert(&mut self.arena, key, tuple)
    }

    /// Stages an update of `key` from `from` (the tuple previously read)
    /// to `to`.
    pub fn update(
        &mut self,
        table: TableId,
        key: RowKey,
        from: &Tuple,
        to: Tuple,
    ) -> TxResult<()> {
        self.cache
            .table_mut(table)?
            .update(&mut self.arena, key, from, to)
    }

    /// Stages a delete of `key`; `tuple` is the payload previously read,
    /// needed to unstitch the indexes.
    pub fn remove(&mut self, table: TableId, key: RowKey, tuple: &Tuple) -> TxResult<()> {
        self.cache.table_mut(table)?.remove(key, tuple)
    }

    // -----------------------------------------------------------------
    // Index scans
    // -----------------------------------------------------------------

    /// A forward iterator over the named index from the first entry at or
    /// above `key`, merged with this transaction's staged index writes.
    pub fn lower_bound(
        &mut self,
        table: TableId,
        index: &str,
        key: &[FieldValue],
    ) -> TxResult<IndexIterator<'_>> {
        let cache = self.cache.table_mut(table)?;
        let wrapper = cache
            .index_mut(index)
            .ok_or_else(|| TransactionError::OpenTable(format!("no such index '{index}'")))?;
        wrapper.lower_bound(key)
    }

    /// The backward counterpart of [`lower_bound`](Self::lower_bound).
    pub fn reverse_lower_bound(
        &mut self,
        table: TableId,
        index: &str,
        key: &[FieldValue],
    ) -> TxResult<IndexIterator<'_>> {
        let cache = self.cache.table_mut(table)?;
        let wrapper = cache
            .index_mut(index)
            .ok_or_else(|| TransactionError::OpenTable(format!("no such index '{index}'")))?;
        wrapper.reverse_lower_bound(key)
    }

    // -----------------------------------------------------------------
    // Scans
    // -----------------------------------------------------------------

    /// Dispatches a pushed-down scan. Analytical transactions only.
    pub fn scan(&mut self, query: &ScanQuery, memory: usize) -> TxResult<ScanResult> {
        if self.ty != TransactionType::Analytical {
            return Err(TransactionError::NotAnalytical);
        }
        let schema = self.schema(query.table())?;
        query.verify(&schema)?;
        let result_schema = query.result_schema(&schema)?;
        let (kind, selection, query_bytes) = query.serialize();
        let records = self.store.scan(
            query.table(),
            &self.snapshot,
            memory,
            kind,
            &selection,
            &query_bytes,
        )?;
        Ok(ScanResult::new(result_schema, records))
    }

    // -----------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------

    /// Materialises a new named counter.
    #[must_use]
    pub fn create_counter(&self, name: &str) -> Arc<RemoteCounter> {
        self.context.counter(name)
    }

    /// The counter with the given name.
    #[must_use]
    pub fn get_counter(&self, name: &str) -> Arc<RemoteCounter> {
        self.context.counter(name)
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Commits the transaction.
    ///
    /// Order: persist the undo log, dispatch tuple writes, dispatch index
    /// writes, drop the undo log, release the snapshot. On conflict the
    /// already-persisted writes are rolled back before the error returns,
    /// so a failed commit leaves no trace.
    pub fn commit(mut self) -> TxResult<()> {
        if self.ty != TransactionType::ReadWrite && self.cache.has_changes() {
            return Err(TransactionError::ReadOnly);
        }
        if !self.cache.has_changes() {
            self.store.commit(&self.snapshot)?;
            self.finished = true;
            return Ok(());
        }

        self.write_undo_log()?;
        let mut applied = self.cache.write_back(&self.arena);
        if applied.is_ok() {
            applied = self.cache.write_indexes();
        }
        if let Err(e) = applied {
            debug!(version = self.snapshot.version, "commit failed, unwinding");
            self.unwind();
            self.finished = true;
            return Err(e);
        }
        self.drop_undo_log();
        self.store.commit(&self.snapshot)?;
        self.finished = true;
        debug!(version = self.snapshot.version, "committed");
        Ok(())
    }

    /// Rolls the transaction back explicitly, reverting anything already
    /// persisted and releasing the snapshot.
    pub fn rollback(mut self) -> TxResult<()> {
        self.unwind();
        self.finished = true;
        Ok(())
    }

    /// Persists the undo log in 16 KiB chunks under
    /// `version << 16 | chunk`.
    fn write_undo_log(&mut self) -> TxResult<()> {
        let log = self.cache.undo_log(true);
        let chunks = log.chunks(CHUNK_SIZE);
        let count = chunks.len();
        if count > usize::from(u16::MAX) {
            return Err(TransactionError::UndoLogTooLarge { chunks: count });
        }
        let tx_table = self.context.tx_table();
        for (i, chunk) in chunks.enumerate() {
            let tuple = Tuple::from_named(
                Arc::clone(&tx_table.schema),
                [("value", FieldValue::Blob(chunk.to_vec()))],
            )?;
            let data = stratadb_core::encode_tuple(&tuple)?;
            self.store.insert(
                tx_table.id,
                chunk_key(self.snapshot.version, i as u16),
                0,
                &data,
            )?;
            self.log_chunks = (i + 1) as u16;
        }
        Ok(())
    }

    /// Removes the persisted undo-log chunks.
    fn drop_undo_log(&mut self) {
        let tx_table = self.context.tx_table();
        for i in 0..self.log_chunks {
            let key = chunk_key(self.snapshot.version, i);
            if let Err(e) = self.store.remove(tx_table.id, key, ANY_VERSION) {
                warn!(chunk = i, error = %e, "failed to drop undo-log chunk");
            }
        }
        self.log_chunks = 0;
    }

    /// Reverts persisted writes (indexes first, tuples second), drops the
    /// undo log and releases the snapshot.
    fn unwind(&mut self) {
        if let Err(e) = self.cache.rollback() {
            // An index compensation the tree refuses would leave the tree
            // inconsistent with the table; there is nothing sane left to
            // do with this client.
            panic!("rollback failed: {e}");
        }
        self.drop_undo_log();
        if let Err(e) = self.store.commit(&self.snapshot) {
            warn!(version = self.snapshot.version, error = %e, "failed to release snapshot");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(version = self.snapshot.version, "dropping uncommitted transaction");
            self.unwind();
            self.finished = true;
        }
    }
}
