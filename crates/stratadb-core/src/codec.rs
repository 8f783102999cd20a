//! Tuple <-> record payload codec.
//!
//! The serialized form of a tuple, in order:
//!
//! 1. the null bitmap, padded to the schema's header size (absent when
//!    every field is NOT NULL),
//! 2. fixed-size fields at their precomputed offsets, little-endian and
//!    naturally aligned,
//! 3. one 4-byte var-heap offset per variable field plus a trailing
//!    sentinel offset pointing at the end of the heap,
//! 4. the var-heap bytes.
//!
//! A NULL fixed field serializes as zero bytes; a NULL variable field gets
//! a zero-length heap slice at the current heap cursor. Total size is
//! padded to a multiple of 8. Decoders recover any variable field's length
//! as `next_offset - this_offset`, which is why the sentinel exists.

use std::sync::Arc;

use crate::error::CoreError;
use crate::schema::{align_up, Schema};
use crate::tuple::Tuple;
use crate::types::{FieldType, FieldValue};

/// The serialized size of a tuple, 8-byte aligned.
#[must_use]
pub fn encoded_size(tuple: &Tuple) -> usize {
    let layout = tuple.schema().layout();
    let heap: usize = tuple
        .fields()
        .iter()
        .map(|v| match v {
            FieldValue::Text(s) => s.len(),
            FieldValue::Blob(b) => b.len(),
            _ => 0,
        })
        .sum();
    align_up(layout.static_size + heap, 8)
}

/// Encodes a tuple into the store's record payload.
///
/// # Errors
///
/// Returns [`CoreError::FieldNotSet`] if a NOT NULL field is NULL and
/// [`CoreError::WrongFieldType`] if a value disagrees with the schema.
pub fn encode_tuple(tuple: &Tuple) -> Result<Vec<u8>, CoreError> {
    let schema = tuple.schema();
    let layout = schema.layout();
    let total = encoded_size(tuple);
    let mut buf = vec![0u8; total];

    let mut heap_cursor = layout.static_size;
    let mut var_idx = 0usize;
    for (i, def) in schema.fields().iter().enumerate() {
        let value = &tuple.fields()[i];
        let is_fixed = i < schema.fixed_count();
        if value.is_null() {
            if def.not_null {
                return Err(CoreError::FieldNotSet(def.name.clone()));
            }
            set_null_bit(&mut buf, layout.header_size, i);
            if !is_fixed {
                // A null variable field still owns a (zero-length) slot.
                write_u32(&mut buf, layout.var_slot_offsets[var_idx], heap_cursor as u32);
                var_idx += 1;
            }
            // Null fixed fields keep their zeroed bytes.
            continue;
        }
        if value.field_type() != def.field_type {
            return Err(CoreError::WrongFieldType {
                name: def.name.clone(),
                expected: def.field_type,
                actual: value.field_type(),
            });
        }
        if is_fixed {
            let offset = layout.fixed_offsets[i];
            debug_assert_eq!(
                offset % def.field_type.fixed_size().unwrap_or(1),
                0,
                "fixed field must be naturally aligned"
            );
            match value {
                FieldValue::SmallInt(v) => {
                    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
                }
                FieldValue::Int(v) => {
                    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
                }
                FieldValue::BigInt(v) => {
                    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
                }
                FieldValue::Float(v) => {
                    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
                }
                FieldValue::Double(v) => {
                    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
                }
                _ => unreachable!("fixed partition holds only fixed-size values"),
            }
        } else {
            let bytes: &[u8] = match value {
                FieldValue::Text(s) => s.as_bytes(),
                FieldValue::Blob(b) => b,
                _ => unreachable!("variable partition holds only TEXT/BLOB"),
            };
            write_u32(&mut buf, layout.var_slot_offsets[var_idx], heap_cursor as u32);
            buf[heap_cursor..heap_cursor + bytes.len()].copy_from_slice(bytes);
            heap_cursor += bytes.len();
            var_idx += 1;
        }
    }

    // Sentinel: end of the heap, before alignment padding.
    if !layout.var_slot_offsets.is_empty() {
        let sentinel_at = layout.static_size - 4;
        write_u32(&mut buf, sentinel_at, heap_cursor as u32);
    }
    Ok(buf)
}

/// Decodes a record payload back into a tuple.
///
/// A null-flagged field decodes to NULL regardless of the bytes present.
///
/// # Errors
///
/// Returns [`CoreError::Decode`] on truncated buffers or invalid UTF-8 in
/// a TEXT field.
pub fn decode_tuple(schema: Arc<Schema>, data: &[u8]) -> Result<Tuple, CoreError> {
    let layout = schema.layout().clone();
    if data.len() < layout.static_size {
        return Err(CoreError::Decode(format!(
            "record too short: {} < {}",
            data.len(),
            layout.static_size
        )));
    }

    let mut values = Vec::with_capacity(schema.field_count());
    let mut var_idx = 0usize;
    for (i, def) in schema.fields().iter().enumerate() {
        let is_fixed = i < schema.fixed_count();
        if null_bit(data, layout.header_size, i) {
            values.push(FieldValue::Null);
            if !is_fixed {
                var_idx += 1;
            }
            continue;
        }
        if is_fixed {
            let offset = layout.fixed_offsets[i];
            let value = match def.field_type {
                FieldType::SmallInt => FieldValue::SmallInt(i16::from_le_bytes(
                    slice2(data, offset)?,
                )),
                FieldType::Int => FieldValue::Int(i32::from_le_bytes(slice4(data, offset)?)),
                FieldType::BigInt => FieldValue::BigInt(i64::from_le_bytes(slice8(data, offset)?)),
                FieldType::Float => FieldValue::Float(f32::from_le_bytes(slice4(data, offset)?)),
                FieldType::Double => FieldValue::Double(f64::from_le_bytes(slice8(data, offset)?)),
                FieldType::Null | FieldType::Text | FieldType::Blob => {
                    unreachable!("fixed partition holds only fixed-size fields")
                }
            };
            values.push(value);
        } else {
            let slot = layout.var_slot_offsets[var_idx];
            let start = u32::from_le_bytes(slice4(data, slot)?) as usize;
            let end = u32::from_le_bytes(slice4(data, slot + 4)?) as usize;
            if end < start || end > data.len() {
                return Err(CoreError::Decode(format!(
                    "bad var-heap range {start}..{end} for field '{}'",
                    def.name
                )));
            }
            let bytes = &data[start..end];
            let value = match def.field_type {
                FieldType::Text => FieldValue::Text(
                    std::str::from_utf8(bytes)
                        .map_err(|e| CoreError::Decode(format!("invalid UTF-8: {e}")))?
                        .to_owned(),
                ),
                FieldType::Blob => FieldValue::Blob(bytes.to_vec()),
                _ => unreachable!("variable partition holds only TEXT/BLOB"),
            };
            values.push(value);
            var_idx += 1;
        }
    }
    Tuple::from_values(schema, values)
}

#[inline]
fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn set_null_bit(buf: &mut [u8], header_size: usize, field: usize) {
    if header_size > 0 {
        buf[field / 8] |= 1 << (field % 8);
    }
}

#[inline]
fn null_bit(buf: &[u8], header_size: usize, field: usize) -> bool {
    header_size > 0 && buf[field / 8] & (1 << (field % 8)) != 0
}

fn slice2(data: &[u8], at: usize) -> Result<[u8; 2], CoreError> {
    data.get(at..at + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CoreError::Decode("record truncated".into()))
}

fn slice4(data: &[u8], at: usize) -> Result<[u8; 4], CoreError> {
    data.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CoreError::Decode("record truncated".into()))
}

fn slice8(data: &[u8], at: usize) -> Result<[u8; 8], CoreError> {
    data.get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CoreError::Decode("record truncated".into()))
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use crate::schema::TableKind;
    use proptest::prelude::*;

    fn wide_schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder(TableKind::Transactional)
                .field("a", FieldType::SmallInt, false)
                .field("b", FieldType::Int, false)
                .field("c", FieldType::BigInt, false)
                .field("d", FieldType::Float, false)
                .field("e", FieldType::Double, false)
                .field("f", FieldType::Text, false)
                .field("g", FieldType::Blob, false)
                .build()
                .unwrap(),
        )
    }

    fn arb_opt<T: std::fmt::Debug>(
        inner: impl Strategy<Value = T>,
        wrap: fn(T) -> FieldValue,
    ) -> impl Strategy<Value = FieldValue> {
        prop_oneof![Just(FieldValue::Null), inner.prop_map(wrap)]
    }

    proptest! {
        #[test]
        fn encode_decode_round_trips(
            a in arb_opt(any::<i16>(), FieldValue::SmallInt),
            b in arb_opt(any::<i32>(), FieldValue::Int),
            c in arb_opt(any::<i64>(), FieldValue::BigInt),
            d in arb_opt(any::<f32>(), FieldValue::Float),
            e in arb_opt(any::<f64>(), FieldValue::Double),
            f in arb_opt(".{0,64}", |s: String| FieldValue::Text(s)),
            g in arb_opt(proptest::collection::vec(any::<u8>(), 0..64), FieldValue::Blob),
        ) {
            let schema = wide_schema();
            let t = Tuple::from_values(
                Arc::clone(&schema),
                vec![a, b, c, d, e, f, g],
            ).unwrap();
            let bytes = encode_tuple(&t).unwrap();
            prop_assert_eq!(bytes.len() % 8, 0);
            let back = decode_tuple(schema, &bytes).unwrap();
            // NaN-free comparison: encode both sides again.
            prop_assert_eq!(encode_tuple(&back).unwrap(), bytes);
        }
    }
}
