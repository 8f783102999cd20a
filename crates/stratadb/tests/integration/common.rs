//! Shared fixtures for the integration tests.

use std::sync::Arc;

use stratadb::{ClientConfig, ClientManager};
use stratadb_core::{FieldType, Schema, TableKind};
use stratadb_store::{MemoryStore, RecordStore};

/// A client manager over a fresh in-memory store.
pub fn manager() -> ClientManager {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    ClientManager::new(store, ClientConfig::default()).expect("bootstrap failed")
}

/// A client manager sharing a context value across fibers.
pub fn manager_with<Ctx: Send + Sync + 'static>(shared: Ctx) -> ClientManager<Ctx> {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    ClientManager::with_shared(store, ClientConfig::default(), shared).expect("bootstrap failed")
}

/// `{foo: INT NOT NULL, bar: TEXT NULL}`.
pub fn foo_bar_schema() -> Schema {
    Schema::builder(TableKind::Transactional)
        .field("foo", FieldType::Int, true)
        .field("bar", FieldType::Text, false)
        .build()
        .expect("schema")
}

/// `{field: INT NOT NULL}` with a unique index on `field`.
pub fn indexed_schema(index_name: &str) -> Schema {
    Schema::builder(TableKind::Transactional)
        .field("field", FieldType::Int, true)
        .index(index_name, true, &["field"])
        .build()
        .expect("schema")
}
