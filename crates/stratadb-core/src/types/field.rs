//! The dynamically typed field value.
//!
//! [`FieldValue`] is the scalar that flows through tuples, index keys and
//! scan predicates. Values are dynamically typed but strongly so: no
//! implicit coercion happens anywhere. Comparing an `Int` with a `BigInt`
//! is an error, not a widening; callers that want mixed-width comparisons
//! cast explicitly with [`FieldValue::cast`].
//!
//! # Example
//!
//! ```
//! use stratadb_core::{FieldType, FieldValue};
//!
//! let a = FieldValue::Int(7);
//! let b = FieldValue::Int(9);
//! assert!(a.try_lt(&b).unwrap());
//!
//! // Widening is explicit.
//! let wide = a.cast(FieldType::BigInt).unwrap();
//! assert_eq!(wide, FieldValue::BigInt(7));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The type tag of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// SQL NULL; the type of an unset nullable field.
    Null,
    /// 16-bit signed integer.
    SmallInt,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit IEEE 754 float.
    Float,
    /// 64-bit IEEE 754 float.
    Double,
    /// UTF-8 text, ordered by its bytes.
    Text,
    /// Opaque bytes; not comparable.
    Blob,
}

impl FieldType {
    /// Size in bytes of the fixed-width representation, or `None` for
    /// variable-size types (and `Null`, which has no representation of
    /// its own).
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::SmallInt => Some(2),
            Self::Int | Self::Float => Some(4),
            Self::BigInt | Self::Double => Some(8),
            Self::Null | Self::Text | Self::Blob => None,
        }
    }

    /// Whether values of this type live in the var-heap.
    #[must_use]
    pub const fn is_var_size(self) -> bool {
        matches!(self, Self::Text | Self::Blob)
    }

    /// Whether arithmetic is defined on this type.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::SmallInt | Self::Int | Self::BigInt | Self::Float | Self::Double
        )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Null => "NULL",
            Self::SmallInt => "SMALLINT",
            Self::Int => "INT",
            Self::BigInt => "BIGINT",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        };
        f.write_str(s)
    }
}

/// A dynamically typed scalar value.
///
/// Ordering and equality are total only within one type tag; cross-type and
/// BLOB comparison return [`CoreError::Incomparable`]. TEXT compares by its
/// UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum FieldValue {
    /// SQL NULL.
    #[default]
    Null,
    /// 16-bit signed integer.
    SmallInt(i16),
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    BigInt(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Blob(Vec<u8>),
}

impl FieldValue {
    /// Returns the type tag of this value.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Null => FieldType::Null,
            Self::SmallInt(_) => FieldType::SmallInt,
            Self::Int(_) => FieldType::Int,
            Self::BigInt(_) => FieldType::BigInt,
            Self::Float(_) => FieldType::Float,
            Self::Double(_) => FieldType::Double,
            Self::Text(_) => FieldType::Text,
            Self::Blob(_) => FieldType::Blob,
        }
    }

    /// Returns `true` if this is NULL.
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as an `i16` if it is a `SmallInt`.
    #[inline]
    #[must_use]
    pub const fn as_smallint(&self) -> Option<i16> {
        match self {
            Self::SmallInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as an `i32` if it is an `Int`.
    #[inline]
    #[must_use]
    pub const fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as an `i64` if it is a `BigInt`.
    #[inline]
    #[must_use]
    pub const fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as an `f32` if it is a `Float`.
    #[inline]
    #[must_use]
    pub const fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as an `f64` if it is a `Double`.
    #[inline]
    #[must_use]
    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a string slice if it is `Text`.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a byte slice if it is a `Blob`.
    #[inline]
    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Compares two values of the same type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Incomparable`] for cross-type comparison, for
    /// BLOBs and for NULL operands.
    pub fn try_cmp(&self, other: &Self) -> Result<std::cmp::Ordering, CoreError> {
        use std::cmp::Ordering;
        let incomparable = || CoreError::Incomparable {
            left: self.field_type(),
            right: other.field_type(),
        };
        match (self, other) {
            (Self::SmallInt(a), Self::SmallInt(b)) => Ok(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Ok(a.cmp(b)),
            (Self::BigInt(a), Self::BigInt(b)) => Ok(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => {
                Ok(a.partial_cmp(b).unwrap_or(Ordering::Equal))
            }
            (Self::Double(a), Self::Double(b)) => {
                Ok(a.partial_cmp(b).unwrap_or(Ordering::Equal))
            }
            (Self::Text(a), Self::Text(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            _ => Err(incomparable()),
        }
    }

    /// `self < other`, failing on incomparable operands.
    pub fn try_lt(&self, other: &Self) -> Result<bool, CoreError> {
        Ok(self.try_cmp(other)? == std::cmp::Ordering::Less)
    }

    /// Adds two values.
    ///
    /// Defined for same-typed numeric operands (wrapping on overflow, the
    /// way the store's aggregation does) and for TEXT, where it
    /// concatenates.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BadArithmetic`] for any other combination.
    pub fn try_add(&self, other: &Self) -> Result<Self, CoreError> {
        match (self, other) {
            (Self::SmallInt(a), Self::SmallInt(b)) => Ok(Self::SmallInt(a.wrapping_add(*b))),
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_add(*b))),
            (Self::BigInt(a), Self::BigInt(b)) => Ok(Self::BigInt(a.wrapping_add(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a + b)),
            (Self::Double(a), Self::Double(b)) => Ok(Self::Double(a + b)),
            (Self::Text(a), Self::Text(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Self::Text(s))
            }
            _ => Err(CoreError::BadArithmetic {
                left: self.field_type(),
                right: other.field_type(),
            }),
        }
    }

    /// Subtracts two values. Defined for same-typed numeric operands.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BadArithmetic`] for any other combination.
    pub fn try_sub(&self, other: &Self) -> Result<Self, CoreError> {
        match (self, other) {
            (Self::SmallInt(a), Self::SmallInt(b)) => Ok(Self::SmallInt(a.wrapping_sub(*b))),
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_sub(*b))),
            (Self::BigInt(a), Self::BigInt(b)) => Ok(Self::BigInt(a.wrapping_sub(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a - b)),
            (Self::Double(a), Self::Double(b)) => Ok(Self::Double(a - b)),
            _ => Err(CoreError::BadArithmetic {
                left: self.field_type(),
                right: other.field_type(),
            }),
        }
    }

    /// Casts this value to another type.
    ///
    /// Numeric casts are bounded: an out-of-range narrowing fails instead
    /// of truncating. Casts to and from TEXT go through string parsing and
    /// formatting. Casting to or from NULL or BLOB is never defined.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BadCast`] if the conversion is undefined or the
    /// value does not fit the target type.
    pub fn cast(&self, to: FieldType) -> Result<Self, CoreError> {
        if self.field_type() == to {
            return Ok(self.clone());
        }
        let bad = || CoreError::BadCast {
            from: self.field_type(),
            to,
        };
        match self {
            Self::Null | Self::Blob(_) => Err(bad()),
            Self::SmallInt(v) => cast_i64(i64::from(*v), to).ok_or_else(bad),
            Self::Int(v) => cast_i64(i64::from(*v), to).ok_or_else(bad),
            Self::BigInt(v) => cast_i64(*v, to).ok_or_else(bad),
            Self::Float(v) => cast_f64(f64::from(*v), to).ok_or_else(bad),
            Self::Double(v) => cast_f64(*v, to).ok_or_else(bad),
            Self::Text(s) => cast_text(s, to).ok_or_else(bad),
        }
    }
}

fn cast_i64(v: i64, to: FieldType) -> Option<FieldValue> {
    match to {
        FieldType::SmallInt => i16::try_from(v).ok().map(FieldValue::SmallInt),
        FieldType::Int => i32::try_from(v).ok().map(FieldValue::Int),
        FieldType::BigInt => Some(FieldValue::BigInt(v)),
        #[allow(clippy::cast_precision_loss)]
        FieldType::Float => Some(FieldValue::Float(v as f32)),
        #[allow(clippy::cast_precision_loss)]
        FieldType::Double => Some(FieldValue::Double(v as f64)),
        FieldType::Text => Some(FieldValue::Text(v.to_string())),
        FieldType::Null | FieldType::Blob => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn cast_f64(v: f64, to: FieldType) -> Option<FieldValue> {
    let to_int = |v: f64, lo: f64, hi: f64| {
        let t = v.trunc();
        (t >= lo && t <= hi).then_some(t)
    };
    match to {
        FieldType::SmallInt => {
            to_int(v, f64::from(i16::MIN), f64::from(i16::MAX)).map(|t| FieldValue::SmallInt(t as i16))
        }
        FieldType::Int => {
            to_int(v, f64::from(i32::MIN), f64::from(i32::MAX)).map(|t| FieldValue::Int(t as i32))
        }
        FieldType::BigInt => {
            // i64::MAX is not exactly representable; the nearest safe bound is 2^63.
            to_int(v, -9_223_372_036_854_775_808.0, 9_223_372_036_854_775_807.0)
                .map(|t| FieldValue::BigInt(t as i64))
        }
        FieldType::Float => Some(FieldValue::Float(v as f32)),
        FieldType::Double => Some(FieldValue::Double(v)),
        FieldType::Text => Some(FieldValue::Text(v.to_string())),
        FieldType::Null | FieldType::Blob => None,
    }
}

fn cast_text(s: &str, to: FieldType) -> Option<FieldValue> {
    match to {
        FieldType::SmallInt => s.trim().parse().ok().map(FieldValue::SmallInt),
        FieldType::Int => s.trim().parse().ok().map(FieldValue::Int),
        FieldType::BigInt => s.trim().parse().ok().map(FieldValue::BigInt),
        FieldType::Float => s.trim().parse().ok().map(FieldValue::Float),
        FieldType::Double => s.trim().parse().ok().map(FieldValue::Double),
        FieldType::Text => Some(FieldValue::Text(s.to_owned())),
        FieldType::Null | FieldType::Blob => None,
    }
}

impl From<i16> for FieldValue {
    fn from(v: i16) -> Self {
        Self::SmallInt(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::SmallInt(v) => v.fmt(f),
            Self::Int(v) => v.fmt(f),
            Self::BigInt(v) => v.fmt(f),
            Self::Float(v) => v.fmt(f),
            Self::Double(v) => v.fmt(f),
            Self::Text(s) => f.write_str(s),
            Self::Blob(b) => write!(f, "<blob:{} bytes>", b.len()),
        }
    }
}
