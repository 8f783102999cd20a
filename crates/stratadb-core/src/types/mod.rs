//! Typed identifiers and the dynamic field value.

mod field;
mod ids;

pub use field::{FieldType, FieldValue};
pub use ids::{FieldId, RowKey, TableId};
