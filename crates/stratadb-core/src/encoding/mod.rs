//! Byte encodings for field values.
//!
//! [`sortable`] provides the order-preserving, self-describing encoding
//! used for index composites: comparing two encoded buffers with `memcmp`
//! yields the same ordering as comparing the original field lists, which
//! lets index pages and staging buffers key on plain byte strings.

pub mod sortable;

pub use sortable::{decode_fields, decode_sortable, encode_fields, encode_sortable};
