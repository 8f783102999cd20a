//! Error types for the core crate.

use thiserror::Error;

use crate::types::FieldType;

/// Errors that can occur while working with fields, schemas and tuples.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two fields of different (or incomparable) types were compared.
    #[error("cannot compare {left} with {right}")]
    Incomparable {
        /// Type of the left operand.
        left: FieldType,
        /// Type of the right operand.
        right: FieldType,
    },

    /// A cast between two field types is not defined.
    #[error("cannot cast {from} to {to}")]
    BadCast {
        /// Source type of the cast.
        from: FieldType,
        /// Target type of the cast.
        to: FieldType,
    },

    /// Arithmetic is not defined for the given operand types.
    #[error("arithmetic not defined for {left} and {right}")]
    BadArithmetic {
        /// Type of the left operand.
        left: FieldType,
        /// Type of the right operand.
        right: FieldType,
    },

    /// A field value did not match the schema's declared type.
    #[error("wrong type for field '{name}': expected {expected}, got {actual}")]
    WrongFieldType {
        /// Name of the offending field.
        name: String,
        /// Type the schema declares.
        expected: FieldType,
        /// Type that was supplied.
        actual: FieldType,
    },

    /// A field name does not exist in the schema.
    #[error("field '{0}' does not exist")]
    FieldDoesNotExist(String),

    /// A tuple was serialized with a required field left unset.
    #[error("field '{0}' is not set")]
    FieldNotSet(String),

    /// A byte buffer could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}
