//! The per-transaction table-cache registry and undo log.
//!
//! `TransactionCache` aggregates the [`TableCache`]s of every table one
//! transaction touched, opening each on first use through the process-wide
//! schema cache. It also produces the undo-log payload: a self-describing
//! byte buffer naming every staged row (and, optionally, every staged
//! index operation), built with a sizer pass followed by a writer pass
//! into an exact-sized buffer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use stratadb_core::{RowKey, Schema, TableId};
use stratadb_index::BdTreeBackend;
use stratadb_store::{RecordStore, Snapshot, TableInfo};

use crate::arena::TupleArena;
use crate::context::ClientContext;
use crate::error::{TransactionError, TxResult};
use crate::index_wrapper::{IndexOp, IndexWrapper};
use crate::table_cache::TableCache;

/// Table caches for one transaction, keyed by table id.
pub struct TransactionCache {
    store: Arc<dyn RecordStore>,
    context: Arc<ClientContext>,
    snapshot: Snapshot,
    tables: BTreeMap<TableId, TableCache>,
}

impl TransactionCache {
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        context: Arc<ClientContext>,
        snapshot: Snapshot,
    ) -> Self {
        Self {
            store,
            context,
            snapshot,
            tables: BTreeMap::new(),
        }
    }

    /// Opens a table for this transaction, consulting the process-wide
    /// schema cache before asking the store.
    pub fn open_table(&mut self, name: &str) -> TxResult<TableId> {
        let info = match self.context.cached_table(name) {
            Some(info) => info,
            None => {
                let info = self
                    .store
                    .get_table(name)?
                    .ok_or_else(|| TransactionError::OpenTable(format!("no such table '{name}'")))?;
                self.context.cache_table(&info);
                info
            }
        };
        self.ensure_cache(&info, false)?;
        Ok(info.id)
    }

    /// Creates a table along with the backing tables of its indexes.
    pub fn create_table(&mut self, name: &str, schema: Schema) -> TxResult<TableId> {
        let info = self
            .store
            .create_table(name, schema)
            .map_err(|e| TransactionError::OpenTable(e.to_string()))?;
        self.context.cache_table(&info);
        self.ensure_cache(&info, true)?;
        Ok(info.id)
    }

    /// The cache for a table id; the table must have been opened in this
    /// transaction.
    pub(crate) fn table_mut(&mut self, id: TableId) -> TxResult<&mut TableCache> {
        self.tables
            .get_mut(&id)
            .ok_or(TransactionError::TableNotOpen(id))
    }

    pub(crate) fn table(&self, id: TableId) -> TxResult<&TableCache> {
        self.tables.get(&id).ok_or(TransactionError::TableNotOpen(id))
    }

    /// Whether any table staged tuple or index changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.tables.values().any(TableCache::is_dirty)
    }

    /// Dispatches every table's staged writes; earlier tables stay
    /// persisted when a later one conflicts — the caller's rollback
    /// reverts them.
    pub fn write_back(&mut self, arena: &TupleArena) -> TxResult<()> {
        for cache in self.tables.values_mut() {
            cache.write_back(arena)?;
        }
        Ok(())
    }

    /// Flushes every staged index operation into the trees.
    pub fn write_indexes(&mut self) -> TxResult<()> {
        for cache in self.tables.values_mut() {
            cache.write_indexes()?;
        }
        Ok(())
    }

    /// Unwinds in reverse commit order: index operations first, then
    /// tuple writes.
    pub fn rollback(&mut self) -> TxResult<()> {
        for cache in self.tables.values_mut() {
            cache.rollback_indexes()?;
        }
        for cache in self.tables.values_mut() {
            cache.rollback();
        }
        Ok(())
    }

    /// Serializes the undo log (see [`undo_log`](crate::undo_log) for the
    /// format). Sizer pass first, then a writer pass into an exact-sized
    /// buffer.
    pub fn undo_log(&self, with_indexes: bool) -> Vec<u8> {
        let dirty: Vec<&TableCache> = self
            .tables
            .values()
            .filter(|cache| cache.is_dirty())
            .collect();

        // Pass one: size.
        let mut size = 4;
        for cache in &dirty {
            size += 8 + 4 + cache.changed_keys().count() * 8;
            size += 4;
            if with_indexes {
                for (name, wrapper) in cache.indexes() {
                    size += 4 + name.len() + 4;
                    for (key, _, _) in wrapper.staged() {
                        size += 4 + key.len() + 1 + 8;
                    }
                }
            }
        }

        // Pass two: write.
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&(dirty.len() as u32).to_le_bytes());
        for cache in &dirty {
            buf.extend_from_slice(&cache.info().id.0.to_le_bytes());
            let keys: Vec<RowKey> = cache.changed_keys().collect();
            buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
            for key in keys {
                buf.extend_from_slice(&key.0.to_le_bytes());
            }
            if with_indexes {
                buf.extend_from_slice(&(cache.indexes().len() as u32).to_le_bytes());
                for (name, wrapper) in cache.indexes() {
                    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
                    buf.extend_from_slice(name.as_bytes());
                    let ops: Vec<_> = wrapper.staged().collect();
                    buf.extend_from_slice(&(ops.len() as u32).to_le_bytes());
                    for (key, op, row) in ops {
                        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                        buf.extend_from_slice(key);
                        buf.push(match op {
                            IndexOp::Insert => 0,
                            IndexOp::Delete => 1,
                        });
                        buf.extend_from_slice(&row.0.to_le_bytes());
                    }
                }
            } else {
                buf.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        debug_assert_eq!(buf.len(), size, "sizer and writer disagree");
        buf
    }

    fn ensure_cache(&mut self, info: &TableInfo, create: bool) -> TxResult<()> {
        if self.tables.contains_key(&info.id) {
            return Ok(());
        }
        let indexes = self.open_indexes(info, create)?;
        self.tables.insert(
            info.id,
            TableCache::new(
                info.clone(),
                Arc::clone(&self.store),
                self.snapshot,
                indexes,
            ),
        );
        Ok(())
    }

    fn open_indexes(
        &self,
        info: &TableInfo,
        create: bool,
    ) -> TxResult<HashMap<String, IndexWrapper>> {
        let mut wrappers = HashMap::new();
        for def in info.schema.indexes() {
            let (ptr_table, node_table) = self.context.index_backing(&def.name, || {
                if create {
                    BdTreeBackend::create_tables(&self.store, &def.name)
                } else {
                    BdTreeBackend::open_tables(&self.store, &def.name)
                }
            })?;
            let backend = BdTreeBackend::new(
                Arc::clone(&self.store),
                ptr_table,
                node_table,
                self.context.index_id_allocator(),
            );
            let wrapper = IndexWrapper::open(
                def.name.clone(),
                def.unique,
                def.columns.clone(),
                backend,
                self.snapshot,
                create,
            )?;
            wrappers.insert(def.name.clone(), wrapper);
        }
        Ok(wrappers)
    }
}
