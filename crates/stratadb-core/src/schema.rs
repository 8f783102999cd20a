//! Table schemas.
//!
//! A schema is an ordered run of fixed-width fields followed by an ordered
//! run of variable-width fields. Field ids are positional: `0..n_fixed` for
//! the fixed fields, then `n_fixed..n` for the variable ones, which is also
//! the order they appear in the serialized tuple.
//!
//! The byte layout of a tuple is precomputed once per schema (header size,
//! per-field offsets, var-slot positions) so the codec never re-derives it.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{FieldId, FieldType};

/// Rounds `n` up to a multiple of `align`.
#[inline]
#[must_use]
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Whether a table participates in snapshot-isolated transactions.
///
/// Index node/pointer tables and the counter table are non-transactional:
/// their records carry explicit versions and are CAS-updated outside any
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Rows versioned by transaction snapshots.
    Transactional,
    /// Rows versioned by explicit compare-and-swap counters.
    NonTransactional,
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name, unique within the schema.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether NULL is rejected for this field.
    pub not_null: bool,
}

/// A named secondary index over a list of columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique within the schema.
    pub name: String,
    /// Whether at most one live row may carry a given key.
    pub unique: bool,
    /// The indexed columns, in key order.
    pub columns: Vec<FieldId>,
}

/// Precomputed tuple layout for one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    /// Bytes occupied by the null bitmap, padded for alignment. Zero when
    /// every field is NOT NULL.
    pub header_size: usize,
    /// Byte offset of each fixed field, indexed by field id.
    pub fixed_offsets: Vec<usize>,
    /// Byte offset of the 4-byte var-heap slot of each variable field.
    pub var_slot_offsets: Vec<usize>,
    /// Offset where the var-heap begins; equals the serialized size of a
    /// tuple with no variable data. Includes the trailing sentinel slot.
    pub static_size: usize,
}

/// A table schema: typed fields, not-null flags and index definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    kind: TableKind,
    /// Fixed fields first, then variable fields.
    fields: Vec<FieldDef>,
    /// Number of leading fixed-size fields.
    n_fixed: usize,
    indexes: Vec<IndexDef>,
    layout: Layout,
}

impl Schema {
    /// Starts building a schema of the given kind.
    #[must_use]
    pub fn builder(kind: TableKind) -> SchemaBuilder {
        SchemaBuilder {
            kind,
            fixed: Vec::new(),
            var: Vec::new(),
            indexes: Vec::new(),
            index_columns: Vec::new(),
        }
    }

    /// The table kind.
    #[must_use]
    pub const fn kind(&self) -> TableKind {
        self.kind
    }

    /// All fields, fixed first.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Number of leading fixed-size fields.
    #[must_use]
    pub const fn fixed_count(&self) -> usize {
        self.n_fixed
    }

    /// The field definition for an id.
    #[must_use]
    pub fn field(&self, id: FieldId) -> Option<&FieldDef> {
        self.fields.get(id.as_usize())
    }

    /// Resolves a field name to its id.
    #[must_use]
    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| FieldId(i as u16))
    }

    /// Resolves a field name, failing with [`CoreError::FieldDoesNotExist`].
    pub fn require_field_id(&self, name: &str) -> Result<FieldId, CoreError> {
        self.field_id(name)
            .ok_or_else(|| CoreError::FieldDoesNotExist(name.to_owned()))
    }

    /// The index definitions.
    #[must_use]
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Looks up an index by name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Whether every field is declared NOT NULL.
    #[must_use]
    pub fn all_not_null(&self) -> bool {
        self.fields.iter().all(|f| f.not_null)
    }

    /// The precomputed tuple layout.
    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    fn compute_layout(fields: &[FieldDef], n_fixed: usize) -> Layout {
        let any_nullable = fields.iter().any(|f| !f.not_null);
        let header_size = if any_nullable {
            // One bit per field, padded so the first fixed field can be
            // naturally aligned regardless of its width.
            align_up((fields.len() + 7) / 8, 8)
        } else {
            0
        };

        let mut cursor = header_size;
        let mut fixed_offsets = Vec::with_capacity(n_fixed);
        for f in &fields[..n_fixed] {
            let size = f
                .field_type
                .fixed_size()
                .expect("fixed partition holds only fixed-size fields");
            cursor = align_up(cursor, size);
            fixed_offsets.push(cursor);
            cursor += size;
        }

        let n_var = fields.len() - n_fixed;
        let mut var_slot_offsets = Vec::with_capacity(n_var);
        let mut static_size = cursor;
        if n_var > 0 {
            static_size = align_up(static_size, 4);
            for _ in 0..n_var {
                var_slot_offsets.push(static_size);
                static_size += 4;
            }
            // Trailing sentinel slot; decoders compute any field's length
            // as next_offset - this_offset.
            static_size += 4;
        }

        Layout {
            header_size,
            fixed_offsets,
            var_slot_offsets,
            static_size,
        }
    }
}

/// Builder for [`Schema`].
///
/// Fields may be added in any order; the builder partitions them into the
/// fixed-then-variable layout the store requires.
#[derive(Debug)]
pub struct SchemaBuilder {
    kind: TableKind,
    fixed: Vec<FieldDef>,
    var: Vec<FieldDef>,
    indexes: Vec<IndexDef>,
    /// Column names per declared index, resolved to ids in `build`.
    index_columns: Vec<(usize, Vec<String>)>,
}

impl SchemaBuilder {
    /// Adds a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType, not_null: bool) -> Self {
        let def = FieldDef {
            name: name.into(),
            field_type,
            not_null,
        };
        if field_type.is_var_size() {
            self.var.push(def);
        } else {
            self.fixed.push(def);
        }
        self
    }

    /// Declares a secondary index over columns named in `columns`.
    ///
    /// Column names are resolved against the final field order when
    /// [`build`](Self::build) runs.
    #[must_use]
    pub fn index(mut self, name: impl Into<String>, unique: bool, columns: &[&str]) -> Self {
        self.indexes.push(IndexDef {
            name: name.into(),
            unique,
            // Placeholder ids; resolved by name in build().
            columns: Vec::new(),
        });
        let idx = self.indexes.len() - 1;
        // Stash the names in the builder via a parallel vec keyed by index
        // position; reconstructed in build.
        self.index_columns.push((idx, columns.iter().map(|s| (*s).to_owned()).collect()));
        self
    }

    /// Finishes the schema.
    ///
    /// # Errors
    ///
    /// Fails if a field name is duplicated, an index references an unknown
    /// column, or the schema has no fields.
    pub fn build(self) -> Result<Schema, CoreError> {
        let n_fixed = self.fixed.len();
        let mut fields = self.fixed;
        fields.extend(self.var);
        if fields.is_empty() {
            return Err(CoreError::Decode("schema has no fields".into()));
        }
        for (i, f) in fields.iter().enumerate() {
            if fields[..i].iter().any(|g| g.name == f.name) {
                return Err(CoreError::Decode(format!("duplicate field '{}'", f.name)));
            }
        }
        let mut indexes = self.indexes;
        for (pos, names) in self.index_columns {
            let mut columns = Vec::with_capacity(names.len());
            for name in &names {
                let id = fields
                    .iter()
                    .position(|f| &f.name == name)
                    .ok_or_else(|| CoreError::FieldDoesNotExist(name.clone()))?;
                columns.push(FieldId(id as u16));
            }
            indexes[pos].columns = columns;
        }
        let layout = Schema::compute_layout(&fields, n_fixed);
        Ok(Schema {
            kind: self.kind,
            fields,
            n_fixed,
            indexes,
            layout,
        })
    }
}
