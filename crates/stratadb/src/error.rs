//! The transaction error taxonomy.

use thiserror::Error;

use stratadb_core::{CoreError, RowKey, TableId};
use stratadb_index::IndexError;
use stratadb_store::StoreError;

/// Errors surfaced by the transactional API.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// An insert hit a key that exists, live or staged.
    #[error("tuple {0} already exists")]
    TupleExists(RowKey),

    /// A get/update/remove targeted an absent key, or a get targeted a
    /// key this transaction already deleted.
    #[error("tuple {0} does not exist")]
    TupleDoesNotExist(RowKey),

    /// A per-key optimistic conflict was detected locally before any
    /// network call.
    #[error("conflict on tuple {0}")]
    Conflict(RowKey),

    /// Writes the store rejected at commit, all collected before giving
    /// up, so one failed commit reports every conflicting key at once.
    #[error("write conflicts on {} tuple(s)", .0.len())]
    Conflicts(Vec<RowKey>),

    /// An index flush found a conflicting live entry.
    #[error("index conflict on '{index}' for tuple {row}")]
    IndexConflict {
        /// The conflicting row.
        row: RowKey,
        /// Name of the index that refused the write.
        index: String,
    },

    /// The store rejected opening or creating a table.
    #[error("cannot open table: {0}")]
    OpenTable(String),

    /// A table id that was never opened in this transaction.
    #[error("table {0} is not open in this transaction")]
    TableNotOpen(TableId),

    /// A value's type does not match the schema.
    #[error("wrong type for field '{0}'")]
    WrongFieldType(String),

    /// A required field was left unset.
    #[error("field '{0}' is not set")]
    FieldNotSet(String),

    /// No such field in the schema.
    #[error("field '{0}' does not exist")]
    FieldDoesNotExist(String),

    /// Writes were staged in a read-only or analytical transaction.
    #[error("transaction is not read-write")]
    ReadOnly,

    /// A scan was issued outside an analytical transaction.
    #[error("scans require an analytical transaction")]
    NotAnalytical,

    /// The undo log would not fit its key space.
    #[error("undo log needs {chunks} chunks, more than the key space allows")]
    UndoLogTooLarge {
        /// Chunks the log would need.
        chunks: usize,
    },

    /// A field-level failure outside the named taxonomy.
    #[error(transparent)]
    Codec(CoreError),

    /// An index failure outside the conflict path.
    #[error(transparent)]
    Index(IndexError),

    /// A store failure outside the conflict path.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CoreError> for TransactionError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::WrongFieldType { name, .. } => Self::WrongFieldType(name),
            CoreError::FieldNotSet(name) => Self::FieldNotSet(name),
            CoreError::FieldDoesNotExist(name) => Self::FieldDoesNotExist(name),
            other => Self::Codec(other),
        }
    }
}

impl From<IndexError> for TransactionError {
    fn from(e: IndexError) -> Self {
        Self::Index(e)
    }
}

/// Result alias for the transactional API.
pub type TxResult<T> = Result<T, TransactionError>;
