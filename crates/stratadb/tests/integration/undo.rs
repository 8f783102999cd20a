//! Undo-log replay semantics.

use std::sync::Arc;

use stratadb::undo_log::{replay, UndoLogTable};
use stratadb::RowKey;
use stratadb_core::{encode_tuple, FieldType, FieldValue, Schema, TableKind, Tuple};
use stratadb_store::{MemoryStore, RecordStore, TransactionType};

fn payload(schema: &Arc<Schema>, v: i32) -> Vec<u8> {
    let t = Tuple::from_named(Arc::clone(schema), [("v", FieldValue::Int(v))]).unwrap();
    encode_tuple(&t).unwrap()
}

#[test]
fn replay_reverts_the_logged_writes() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let schema = Schema::builder(TableKind::Transactional)
        .field("v", FieldType::Int, true)
        .build()
        .unwrap();
    let info = store.create_table("t", schema).unwrap();
    let schema = Arc::clone(&info.schema);

    let base = store.start_transaction(TransactionType::ReadWrite).unwrap();
    store.insert(info.id, 1, base.version, &payload(&schema, 10)).unwrap();
    store.commit(&base).unwrap();

    // A crashed writer left an uncommitted update and an insert behind.
    let crashed = store.start_transaction(TransactionType::ReadWrite).unwrap();
    store.update(info.id, 1, crashed.version, &payload(&schema, 99)).unwrap();
    store.insert(info.id, 2, crashed.version, &payload(&schema, 42)).unwrap();

    let log = vec![UndoLogTable {
        table: info.id,
        keys: vec![RowKey(1), RowKey(2)],
        indexes: Vec::new(),
    }];
    replay(&*store, &log, crashed.version).unwrap();

    // A later reader sees the pre-crash state.
    let reader = store.start_transaction(TransactionType::ReadWrite).unwrap();
    let record = store.get(info.id, 1, reader.version).unwrap().unwrap();
    assert_eq!(record.version, base.version);
    assert!(store.get(info.id, 2, reader.version).unwrap().is_none());
}

#[test]
fn replaying_twice_equals_replaying_once() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let schema = Schema::builder(TableKind::Transactional)
        .field("v", FieldType::Int, true)
        .build()
        .unwrap();
    let info = store.create_table("t", schema).unwrap();
    let schema = Arc::clone(&info.schema);

    let base = store.start_transaction(TransactionType::ReadWrite).unwrap();
    store.insert(info.id, 1, base.version, &payload(&schema, 1)).unwrap();
    store.commit(&base).unwrap();

    let crashed = store.start_transaction(TransactionType::ReadWrite).unwrap();
    store.update(info.id, 1, crashed.version, &payload(&schema, 2)).unwrap();

    let log = vec![UndoLogTable {
        table: info.id,
        keys: vec![RowKey(1)],
        indexes: Vec::new(),
    }];
    replay(&*store, &log, crashed.version).unwrap();
    replay(&*store, &log, crashed.version).unwrap();

    let reader = store.start_transaction(TransactionType::ReadWrite).unwrap();
    let record = store.get(info.id, 1, reader.version).unwrap().unwrap();
    assert_eq!(record.version, base.version);
}
