//! Tuples: one typed row of a table.
//!
//! A tuple is an ordered sequence of [`FieldValue`]s matching its schema,
//! addressable by field id or field name. Tuples are logically immutable
//! once handed out by a transaction; updates build a new tuple (usually via
//! [`Tuple::with`]) rather than mutating in place.

use std::sync::Arc;

use crate::error::CoreError;
use crate::schema::Schema;
use crate::types::{FieldId, FieldValue};

/// One row of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    schema: Arc<Schema>,
    fields: Vec<FieldValue>,
}

impl Tuple {
    /// Creates a tuple with every field NULL.
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        let fields = vec![FieldValue::Null; schema.field_count()];
        Self { schema, fields }
    }

    /// Creates a tuple from a complete value list in field-id order.
    ///
    /// # Errors
    ///
    /// Fails if the count does not match the schema or a value's type does
    /// not match its field's declared type (NULL is accepted everywhere;
    /// not-null enforcement happens at encode time).
    pub fn from_values(schema: Arc<Schema>, values: Vec<FieldValue>) -> Result<Self, CoreError> {
        if values.len() != schema.field_count() {
            return Err(CoreError::Decode(format!(
                "expected {} fields, got {}",
                schema.field_count(),
                values.len()
            )));
        }
        let mut tuple = Self {
            schema,
            fields: values,
        };
        for id in 0..tuple.fields.len() {
            tuple.check_type(FieldId(id as u16), &tuple.fields[id])?;
        }
        Ok(tuple)
    }

    /// Creates a tuple from `(name, value)` pairs; unnamed fields stay NULL.
    ///
    /// # Errors
    ///
    /// Fails on unknown names or type mismatches.
    pub fn from_named(
        schema: Arc<Schema>,
        values: impl IntoIterator<Item = (impl AsRef<str>, FieldValue)>,
    ) -> Result<Self, CoreError> {
        let mut tuple = Self::new(schema);
        for (name, value) in values {
            tuple.set_named(name.as_ref(), value)?;
        }
        Ok(tuple)
    }

    /// The schema this tuple belongs to.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// All field values in id order.
    #[must_use]
    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    /// The value of a field by id.
    pub fn get(&self, id: FieldId) -> Result<&FieldValue, CoreError> {
        self.fields
            .get(id.as_usize())
            .ok_or_else(|| CoreError::FieldDoesNotExist(format!("#{}", id.0)))
    }

    /// The value of a field by name.
    pub fn get_named(&self, name: &str) -> Result<&FieldValue, CoreError> {
        let id = self.schema.require_field_id(name)?;
        self.get(id)
    }

    /// Sets a field by id, checking the type against the schema.
    pub fn set(&mut self, id: FieldId, value: FieldValue) -> Result<(), CoreError> {
        self.check_type(id, &value)?;
        self.fields[id.as_usize()] = value;
        Ok(())
    }

    /// Sets a field by name.
    pub fn set_named(&mut self, name: &str, value: FieldValue) -> Result<(), CoreError> {
        let id = self.schema.require_field_id(name)?;
        self.set(id, value)
    }

    /// Returns a copy of this tuple with one field replaced.
    ///
    /// This is the update idiom: the original stays untouched.
    pub fn with(&self, name: &str, value: FieldValue) -> Result<Self, CoreError> {
        let mut next = self.clone();
        next.set_named(name, value)?;
        Ok(next)
    }

    /// Extracts the values of the given columns, cloning them in order.
    #[must_use]
    pub fn project(&self, columns: &[FieldId]) -> Vec<FieldValue> {
        columns
            .iter()
            .map(|id| self.fields[id.as_usize()].clone())
            .collect()
    }

    fn check_type(&self, id: FieldId, value: &FieldValue) -> Result<(), CoreError> {
        let def = self
            .schema
            .field(id)
            .ok_or_else(|| CoreError::FieldDoesNotExist(format!("#{}", id.0)))?;
        if !value.is_null() && value.field_type() != def.field_type {
            return Err(CoreError::WrongFieldType {
                name: def.name.clone(),
                expected: def.field_type,
                actual: value.field_type(),
            });
        }
        Ok(())
    }
}
