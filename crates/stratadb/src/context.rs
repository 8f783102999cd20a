//! The process-wide client context.
//!
//! One `ClientContext` exists per client process. It bootstraps the
//! utility tables (`__counter`, `__clients`, `__transactions_<client>`),
//! registers the client row used for undo-log ownership, and caches
//! schemas, index backing tables and counters across transactions so a
//! transaction's first touch of a table usually costs no round-trip.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use stratadb_core::{FieldType, FieldValue, Schema, TableId, TableKind, Tuple};
use stratadb_index::{IdAllocator, IndexError, IndexResult};
use stratadb_store::{RecordStore, TableInfo};

use crate::counter::RemoteCounter;
use crate::error::{TransactionError, TxResult};

const COUNTER_TABLE: &str = "__counter";
const CLIENTS_TABLE: &str = "__clients";

/// Counter row that deals out client ids.
const CLIENT_ID_COUNTER: &str = "clients";

/// Counter row that deals out tree pointer ids.
const INDEX_ID_COUNTER: &str = "index_ids";

/// FNV-1a, used to map counter names onto rows of the counter table.
fn counter_row(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in name.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn counter_schema() -> Schema {
    Schema::builder(TableKind::NonTransactional)
        .field("value", FieldType::BigInt, true)
        .build()
        .expect("static schema")
}

fn clients_schema() -> Schema {
    Schema::builder(TableKind::NonTransactional)
        .field("value", FieldType::BigInt, true)
        .build()
        .expect("static schema")
}

fn tx_log_schema() -> Schema {
    Schema::builder(TableKind::NonTransactional)
        .field("value", FieldType::Blob, true)
        .build()
        .expect("static schema")
}

/// Shared client state: utility tables and cross-transaction caches.
pub struct ClientContext {
    store: Arc<dyn RecordStore>,
    counter_table: TableInfo,
    tx_table: TableInfo,
    client_id: u64,
    /// Schema cache by table name.
    tables_by_name: RwLock<HashMap<String, TableInfo>>,
    /// Schema cache by table id.
    tables_by_id: RwLock<HashMap<TableId, TableInfo>>,
    /// Backing tables per index name.
    index_tables: RwLock<HashMap<String, (TableInfo, TableInfo)>>,
    /// One counter per name, process-wide.
    counters: RwLock<HashMap<String, Arc<RemoteCounter>>>,
    /// Pointer-id source shared by every index tree.
    index_ids: Arc<RemoteCounter>,
}

impl ClientContext {
    /// Bootstraps the context: opens or creates the utility tables and
    /// claims a client id.
    pub fn bootstrap(store: Arc<dyn RecordStore>) -> TxResult<Arc<Self>> {
        let counter_table = open_or_create(&store, COUNTER_TABLE, counter_schema)?;
        let clients_table = open_or_create(&store, CLIENTS_TABLE, clients_schema)?;

        let client_counter = RemoteCounter::new(
            Arc::clone(&store),
            counter_table.clone(),
            counter_row(CLIENT_ID_COUNTER),
        );
        let client_id = client_counter.next()?;
        let row = Tuple::from_named(
            Arc::clone(&clients_table.schema),
            [("value", FieldValue::BigInt(client_id as i64))],
        )?;
        store.insert(
            clients_table.id,
            client_id,
            0,
            &stratadb_core::encode_tuple(&row)?,
        )?;

        let tx_table = open_or_create(
            &store,
            &format!("__transactions_{client_id}"),
            tx_log_schema,
        )?;

        let index_ids = Arc::new(RemoteCounter::new(
            Arc::clone(&store),
            counter_table.clone(),
            counter_row(INDEX_ID_COUNTER),
        ));

        Ok(Arc::new(Self {
            store,
            counter_table,
            tx_table,
            client_id,
            tables_by_name: RwLock::new(HashMap::new()),
            tables_by_id: RwLock::new(HashMap::new()),
            index_tables: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            index_ids,
        }))
    }

    /// This client's id.
    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    /// The per-client undo-log table.
    #[must_use]
    pub fn tx_table(&self) -> &TableInfo {
        &self.tx_table
    }

    /// The shared pointer-id allocator for index trees.
    #[must_use]
    pub fn index_id_allocator(self: &Arc<Self>) -> Arc<dyn IdAllocator> {
        Arc::new(CounterAllocator {
            counter: Arc::clone(&self.index_ids),
        })
    }

    /// A cached table by name, if any transaction opened it before.
    #[must_use]
    pub fn cached_table(&self, name: &str) -> Option<TableInfo> {
        self.tables_by_name.read().get(name).cloned()
    }

    /// A cached table by id.
    #[must_use]
    pub fn cached_table_by_id(&self, id: TableId) -> Option<TableInfo> {
        self.tables_by_id.read().get(&id).cloned()
    }

    /// Publishes a table into the cache.
    pub fn cache_table(&self, info: &TableInfo) {
        self.tables_by_name
            .write()
            .insert(info.name.clone(), info.clone());
        self.tables_by_id.write().insert(info.id, info.clone());
    }

    /// The backing tables of an index, cached across transactions.
    pub fn index_backing(
        &self,
        index_name: &str,
        open: impl FnOnce() -> IndexResult<(TableInfo, TableInfo)>,
    ) -> Result<(TableInfo, TableInfo), IndexError> {
        if let Some(found) = self.index_tables.read().get(index_name) {
            return Ok(found.clone());
        }
        let opened = open()?;
        self.index_tables
            .write()
            .insert(index_name.to_owned(), opened.clone());
        Ok(opened)
    }

    /// Materialises (or returns) the counter with the given name.
    ///
    /// Counters live in the shared counter table, one row per name.
    pub fn counter(&self, name: &str) -> Arc<RemoteCounter> {
        if let Some(counter) = self.counters.read().get(name) {
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write();
        Arc::clone(counters.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(RemoteCounter::new(
                Arc::clone(&self.store),
                self.counter_table.clone(),
                counter_row(name),
            ))
        }))
    }
}

fn open_or_create(
    store: &Arc<dyn RecordStore>,
    name: &str,
    schema: fn() -> Schema,
) -> TxResult<TableInfo> {
    if let Some(info) = store.get_table(name)? {
        return Ok(info);
    }
    match store.create_table(name, schema()) {
        Ok(info) => Ok(info),
        // Lost a bootstrap race against another client.
        Err(stratadb_store::StoreError::TableExists(_)) => store
            .get_table(name)?
            .ok_or_else(|| TransactionError::OpenTable(format!("table '{name}' vanished"))),
        Err(e) => Err(TransactionError::OpenTable(e.to_string())),
    }
}

/// Adapts the shared counter into the index crate's allocator trait.
///
/// Logical pointer 1 is reserved for tree roots, so allocations are
/// shifted up by one.
struct CounterAllocator {
    counter: Arc<RemoteCounter>,
}

impl IdAllocator for CounterAllocator {
    fn next_id(&self) -> IndexResult<u64> {
        self.counter
            .next()
            .map(|v| v + 1)
            .map_err(|e| IndexError::Allocation(e.to_string()))
    }
}
