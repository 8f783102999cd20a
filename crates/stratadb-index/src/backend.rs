//! The pointer-table / node-table adapter.
//!
//! The tree sees two collaborators: a *pointer table* mapping logical
//! pointer to `(physical pointer, CAS version)` and a *node table* storing
//! opaque page bytes. Both are plain non-transactional store tables with a
//! single-column schema, keyed by ids drawn from an [`IdAllocator`].
//!
//! Store errors translate to tree errors as follows:
//!
//! | store error     | on insert       | on update/remove     |
//! |-----------------|-----------------|----------------------|
//! | `NotFound`      | -               | `ObjectDoesntExist`  |
//! | `InvalidWrite`  | `ObjectExists`  | `ObjectDoesntExist`  |
//! | `NotInSnapshot` | `ObjectExists`  | `WrongVersion`       |
//!
//! Removing "at any version" passes `ANY_VERSION` (`u64::MAX - 2`), because
//! the store reserves `u64::MAX` for the live version.

use std::sync::Arc;

use stratadb_core::{decode_tuple, encode_tuple, FieldType, FieldValue, Schema, TableKind, Tuple};
use stratadb_store::{RecordStore, StoreError, TableInfo, ANY_VERSION};

use crate::error::{IndexError, IndexResult};

/// Identifies a page slot; stable across page rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalPtr(pub u64);

/// Identifies one physical page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalPtr(pub u64);

/// The logical pointer of every tree's root. [`IdAllocator`]
/// implementations must never hand this id out.
pub const ROOT_LPTR: LogicalPtr = LogicalPtr(1);

/// Allocates fresh u64 ids for logical and physical pointers.
///
/// Ids must be unique per index for the lifetime of its tables and must
/// be greater than [`ROOT_LPTR`]'s value.
pub trait IdAllocator: Send + Sync {
    /// Returns the next unique id.
    fn next_id(&self) -> IndexResult<u64>;
}

const PTR_FIELD: &str = "pptr";
const NODE_FIELD: &str = "node";

fn ptr_schema() -> Schema {
    Schema::builder(TableKind::NonTransactional)
        .field(PTR_FIELD, FieldType::BigInt, true)
        .build()
        .expect("static schema")
}

fn node_schema() -> Schema {
    Schema::builder(TableKind::NonTransactional)
        .field(NODE_FIELD, FieldType::Blob, true)
        .build()
        .expect("static schema")
}

/// Adapts two store tables into the tree's pointer and node tables.
pub struct BdTreeBackend {
    store: Arc<dyn RecordStore>,
    ptr_table: TableInfo,
    node_table: TableInfo,
    alloc: Arc<dyn IdAllocator>,
}

impl BdTreeBackend {
    /// Wraps existing pointer and node tables.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        ptr_table: TableInfo,
        node_table: TableInfo,
        alloc: Arc<dyn IdAllocator>,
    ) -> Self {
        Self {
            store,
            ptr_table,
            node_table,
            alloc,
        }
    }

    /// Creates the backing tables for an index, named
    /// `__index_ptrs_<name>` and `__index_nodes_<name>`.
    pub fn create_tables(
        store: &Arc<dyn RecordStore>,
        index_name: &str,
    ) -> IndexResult<(TableInfo, TableInfo)> {
        let ptr = store.create_table(&format!("__index_ptrs_{index_name}"), ptr_schema())?;
        let node = store.create_table(&format!("__index_nodes_{index_name}"), node_schema())?;
        Ok((ptr, node))
    }

    /// Opens the backing tables of an existing index.
    pub fn open_tables(
        store: &Arc<dyn RecordStore>,
        index_name: &str,
    ) -> IndexResult<(TableInfo, TableInfo)> {
        let ptr = store
            .get_table(&format!("__index_ptrs_{index_name}"))?
            .ok_or(IndexError::ObjectDoesntExist)?;
        let node = store
            .get_table(&format!("__index_nodes_{index_name}"))?
            .ok_or(IndexError::ObjectDoesntExist)?;
        Ok((ptr, node))
    }

    /// Allocates a fresh logical pointer.
    pub fn alloc_logical(&self) -> IndexResult<LogicalPtr> {
        Ok(LogicalPtr(self.alloc.next_id()?))
    }

    /// Allocates a fresh physical pointer.
    pub fn alloc_physical(&self) -> IndexResult<PhysicalPtr> {
        Ok(PhysicalPtr(self.alloc.next_id()?))
    }

    /// Reads a logical pointer: `(physical pointer, CAS version)`.
    pub fn read_ptr(&self, lptr: LogicalPtr) -> IndexResult<(PhysicalPtr, u64)> {
        let record = self
            .store
            .get(self.ptr_table.id, lptr.0, u64::MAX)?
            .ok_or(IndexError::ObjectDoesntExist)?;
        let tuple = decode_tuple(Arc::clone(&self.ptr_table.schema), &record.data)
            .map_err(|e| IndexError::CorruptNode(e.to_string()))?;
        let pptr = tuple
            .get_named(PTR_FIELD)
            .ok()
            .and_then(FieldValue::as_bigint)
            .ok_or_else(|| IndexError::CorruptNode("pointer record without pptr".into()))?;
        Ok((PhysicalPtr(pptr as u64), record.version))
    }

    /// Inserts a fresh logical pointer.
    pub fn insert_ptr(&self, lptr: LogicalPtr, pptr: PhysicalPtr) -> IndexResult<()> {
        match self
            .store
            .insert(self.ptr_table.id, lptr.0, 0, &self.ptr_payload(pptr)?)
        {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidWrite | StoreError::NotInSnapshot) => {
                Err(IndexError::ObjectExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Swings a logical pointer to a new physical page, conditioned on the
    /// version observed by [`read_ptr`](Self::read_ptr).
    pub fn update_ptr(
        &self,
        lptr: LogicalPtr,
        pptr: PhysicalPtr,
        expected_version: u64,
    ) -> IndexResult<()> {
        match self.store.update(
            self.ptr_table.id,
            lptr.0,
            expected_version,
            &self.ptr_payload(pptr)?,
        ) {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidWrite) => Err(IndexError::ObjectDoesntExist),
            Err(StoreError::NotInSnapshot) => Err(IndexError::WrongVersion),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a logical pointer. `u64::MAX` means "any version".
    pub fn remove_ptr(&self, lptr: LogicalPtr, version: u64) -> IndexResult<()> {
        // The store reserves MAX for the live version.
        let version = if version == u64::MAX { ANY_VERSION } else { version };
        match self.store.remove(self.ptr_table.id, lptr.0, version) {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidWrite) => Err(IndexError::ObjectDoesntExist),
            Err(StoreError::NotInSnapshot) => Err(IndexError::WrongVersion),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads a physical page's bytes.
    pub fn read_node(&self, pptr: PhysicalPtr) -> IndexResult<Vec<u8>> {
        let record = self
            .store
            .get(self.node_table.id, pptr.0, u64::MAX)?
            .ok_or(IndexError::ObjectDoesntExist)?;
        let tuple = decode_tuple(Arc::clone(&self.node_table.schema), &record.data)
            .map_err(|e| IndexError::CorruptNode(e.to_string()))?;
        match tuple.get_named(NODE_FIELD) {
            Ok(FieldValue::Blob(bytes)) => Ok(bytes.clone()),
            _ => Err(IndexError::CorruptNode("node record without bytes".into())),
        }
    }

    /// Writes a physical page.
    pub fn insert_node(&self, pptr: PhysicalPtr, bytes: &[u8]) -> IndexResult<()> {
        let tuple = Tuple::from_named(
            Arc::clone(&self.node_table.schema),
            [(NODE_FIELD, FieldValue::Blob(bytes.to_vec()))],
        )
        .map_err(|e| IndexError::CorruptNode(e.to_string()))?;
        let payload = encode_tuple(&tuple).map_err(|e| IndexError::CorruptNode(e.to_string()))?;
        match self.store.insert(self.node_table.id, pptr.0, 0, &payload) {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidWrite | StoreError::NotInSnapshot) => {
                Err(IndexError::ObjectExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drops a physical page that is no longer referenced.
    pub fn remove_node(&self, pptr: PhysicalPtr) -> IndexResult<()> {
        match self.store.remove(self.node_table.id, pptr.0, ANY_VERSION) {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidWrite) => Err(IndexError::ObjectDoesntExist),
            Err(StoreError::NotInSnapshot) => Err(IndexError::WrongVersion),
            Err(e) => Err(e.into()),
        }
    }

    fn ptr_payload(&self, pptr: PhysicalPtr) -> IndexResult<Vec<u8>> {
        let tuple = Tuple::from_named(
            Arc::clone(&self.ptr_table.schema),
            [(PTR_FIELD, FieldValue::BigInt(pptr.0 as i64))],
        )
        .map_err(|e| IndexError::CorruptNode(e.to_string()))?;
        encode_tuple(&tuple).map_err(|e| IndexError::CorruptNode(e.to_string()))
    }
}
