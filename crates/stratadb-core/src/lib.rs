//! `StrataDB` Core
//!
//! Core types shared by every StrataDB crate: typed field values, table
//! schemas, tuples and the byte codecs that move them in and out of the
//! record store.
//!
//! # Overview
//!
//! StrataDB tables have a fixed schema: an ordered run of fixed-width fields
//! followed by an ordered run of variable-width fields. A [`Tuple`] is one
//! row of such a table, addressable by field id or by field name. The codec
//! in [`codec`] lays a tuple out exactly the way the record store expects it
//! on the wire: null bitmap, fixed fields at their schema offsets, a var-heap
//! offset slot per variable field, then the var-heap itself.
//!
//! # Modules
//!
//! - [`types`] - Typed ids and the [`FieldValue`] scalar
//! - [`schema`] - Table schemas with precomputed layout
//! - [`tuple`] - The tuple type and field access
//! - [`codec`] - Tuple <-> record-payload byte codec
//! - [`encoding`] - Order-preserving and self-describing field encodings

pub mod codec;
pub mod encoding;
pub mod error;
pub mod schema;
pub mod tuple;
pub mod types;

pub use codec::{decode_tuple, encode_tuple, encoded_size};
pub use error::CoreError;
pub use schema::{FieldDef, IndexDef, Schema, SchemaBuilder, TableKind};
pub use tuple::Tuple;
pub use types::{FieldId, FieldType, FieldValue, RowKey, TableId};
