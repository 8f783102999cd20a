//! `StrataDB` - transactions for a distributed, versioned record store.
//!
//! StrataDB is the client-side coordinator that turns a raw multi-version
//! record API into an ACID transactional interface: typed tuples,
//! secondary indexes with ordered range scans, pushed-down analytical
//! scans and batched unique-id generation. The coordinator runs entirely
//! in the client process and talks to a remote record store and commit
//! manager through the [`stratadb_store::RecordStore`] trait.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use stratadb::{ClientConfig, ClientManager, FieldType, FieldValue, RowKey, Tuple};
//! use stratadb_core::{Schema, TableKind};
//! use stratadb_store::{MemoryStore, RecordStore, TransactionType};
//!
//! let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
//! let manager = ClientManager::new(store, ClientConfig::default()).unwrap();
//!
//! let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _ctx| {
//!     let schema = Schema::builder(TableKind::Transactional)
//!         .field("foo", FieldType::Int, true)
//!         .field("bar", FieldType::Text, false)
//!         .build()
//!         .unwrap();
//!     let table = tx.create_table("demo", schema)?;
//!     let row = Tuple::from_named(
//!         tx.schema(table)?,
//!         [("foo", FieldValue::Int(7)), ("bar", FieldValue::Text("hi".into()))],
//!     )?;
//!     tx.insert(table, RowKey(1), row)?;
//!     tx.commit()
//! });
//! fiber.wait().unwrap();
//! ```
//!
//! # How a write travels
//!
//! Every read and write stays local until commit: reads land in a
//! per-table read cache, writes in a per-table change log, and index
//! effects in per-index staging buffers — all allocated from the
//! transaction's arena and visible to the transaction's own reads. At
//! commit the undo log is persisted first, then the tuple writes are
//! dispatched (server-side conflict detection collects every rejected key
//! into one [`TransactionError::Conflicts`]), then the index trees are
//! updated. Any failure unwinds in reverse order.

pub mod arena;
pub mod client;
pub mod context;
pub mod counter;
pub mod error;
pub mod index_wrapper;
pub mod scan;
pub mod table_cache;
pub mod transaction;
pub mod tx_cache;
pub mod undo_log;

pub use arena::{TupleArena, TupleRef};
pub use client::{ClientConfig, ClientManager, FiberContext, Rendezvous, TransactionFiber};
pub use context::ClientContext;
pub use counter::{RemoteCounter, BATCH, THRESHOLD};
pub use error::{TransactionError, TxResult};
pub use index_wrapper::{IndexIterator, IndexOp, IndexWrapper};
pub use scan::{Conjunct, ScanQuery, ScanResult};
pub use table_cache::{ChangeOp, TableCache};
pub use transaction::Transaction;
pub use tx_cache::TransactionCache;

pub use stratadb_core::{
    FieldId, FieldType, FieldValue, RowKey, Schema, TableId, TableKind, Tuple,
};
pub use stratadb_index::Direction;
pub use stratadb_store::{AggregationOp, PredicateOp, Snapshot, TransactionType};
