//! Sort-order preserving encoding for field values.
//!
//! Index keys need an encoding where comparing the encoded bytes
//! lexicographically produces the same ordering as comparing the values,
//! so that tree pages and staging buffers can order entries without
//! re-decoding them.
//!
//! # Encoding design
//!
//! Every value starts with a one-byte type tag; tags order values of
//! different types deterministically (NULL first, then numerics by width,
//! then TEXT, then BLOB). Within one type:
//!
//! - Signed integers XOR their sign bit and are written big-endian, so
//!   negative values sort before positive ones.
//! - Floats use the usual IEEE trick: flip the sign bit of non-negative
//!   values, flip all bits of negative values. NaN normalizes to a single
//!   bit pattern that sorts after every other value of the type.
//! - TEXT and BLOB escape embedded `0x00` as `0x00 0x01` and terminate
//!   with `0x00 0x00`, preserving prefix ordering (`"a" < "aa" < "b"`).
//!
//! The encoding is self-describing: [`decode_sortable`] recovers the value
//! without a schema, and [`decode_fields`] walks a concatenated field list.

use crate::error::CoreError;
use crate::types::FieldValue;

/// Type tags, in sort order.
mod tags {
    pub const NULL: u8 = 0x00;
    pub const SMALLINT: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const BIGINT: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const TEXT: u8 = 0x06;
    pub const BLOB: u8 = 0x07;
}

const ESCAPE: u8 = 0x01;
const TERMINATOR: u8 = 0x00;

/// Appends the sortable encoding of one value to `buf`.
pub fn encode_sortable(value: &FieldValue, buf: &mut Vec<u8>) {
    match value {
        FieldValue::Null => buf.push(tags::NULL),
        FieldValue::SmallInt(v) => {
            buf.push(tags::SMALLINT);
            buf.extend_from_slice(&((*v as u16) ^ 0x8000).to_be_bytes());
        }
        FieldValue::Int(v) => {
            buf.push(tags::INT);
            buf.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
        }
        FieldValue::BigInt(v) => {
            buf.push(tags::BIGINT);
            buf.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        }
        FieldValue::Float(v) => {
            buf.push(tags::FLOAT);
            buf.extend_from_slice(&flip_f32(*v).to_be_bytes());
        }
        FieldValue::Double(v) => {
            buf.push(tags::DOUBLE);
            buf.extend_from_slice(&flip_f64(*v).to_be_bytes());
        }
        FieldValue::Text(s) => {
            buf.push(tags::TEXT);
            encode_escaped(s.as_bytes(), buf);
        }
        FieldValue::Blob(b) => {
            buf.push(tags::BLOB);
            encode_escaped(b, buf);
        }
    }
}

/// Encodes a list of fields by concatenating their sortable encodings.
#[must_use]
pub fn encode_fields(fields: &[FieldValue]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(fields.len() * 9);
    for f in fields {
        encode_sortable(f, &mut buf);
    }
    buf
}

/// Decodes one value from the front of `data`, returning it and the number
/// of bytes consumed.
///
/// # Errors
///
/// Returns [`CoreError::Decode`] on truncated or malformed input.
pub fn decode_sortable(data: &[u8]) -> Result<(FieldValue, usize), CoreError> {
    let tag = *data
        .first()
        .ok_or_else(|| CoreError::Decode("empty sortable value".into()))?;
    let body = &data[1..];
    match tag {
        tags::NULL => Ok((FieldValue::Null, 1)),
        tags::SMALLINT => {
            let raw = u16::from_be_bytes(take::<2>(body)?);
            Ok((FieldValue::SmallInt((raw ^ 0x8000) as i16), 3))
        }
        tags::INT => {
            let raw = u32::from_be_bytes(take::<4>(body)?);
            Ok((FieldValue::Int((raw ^ 0x8000_0000) as i32), 5))
        }
        tags::BIGINT => {
            let raw = u64::from_be_bytes(take::<8>(body)?);
            Ok((
                FieldValue::BigInt((raw ^ 0x8000_0000_0000_0000) as i64),
                9,
            ))
        }
        tags::FLOAT => {
            let raw = u32::from_be_bytes(take::<4>(body)?);
            Ok((FieldValue::Float(unflip_f32(raw)), 5))
        }
        tags::DOUBLE => {
            let raw = u64::from_be_bytes(take::<8>(body)?);
            Ok((FieldValue::Double(unflip_f64(raw)), 9))
        }
        tags::TEXT => {
            let (bytes, used) = decode_escaped(body)?;
            let s = String::from_utf8(bytes)
                .map_err(|e| CoreError::Decode(format!("invalid UTF-8 in key: {e}")))?;
            Ok((FieldValue::Text(s), 1 + used))
        }
        tags::BLOB => {
            let (bytes, used) = decode_escaped(body)?;
            Ok((FieldValue::Blob(bytes), 1 + used))
        }
        other => Err(CoreError::Decode(format!("unknown sortable tag {other:#x}"))),
    }
}

/// Decodes a concatenated field list back into values.
///
/// # Errors
///
/// Returns [`CoreError::Decode`] on malformed input.
pub fn decode_fields(mut data: &[u8]) -> Result<Vec<FieldValue>, CoreError> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (value, used) = decode_sortable(data)?;
        out.push(value);
        data = &data[used..];
    }
    Ok(out)
}

fn take<const N: usize>(data: &[u8]) -> Result<[u8; N], CoreError> {
    data.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CoreError::Decode("sortable value truncated".into()))
}

fn encode_escaped(data: &[u8], buf: &mut Vec<u8>) {
    for &b in data {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(ESCAPE);
        } else {
            buf.push(b);
        }
    }
    buf.push(TERMINATOR);
    buf.push(TERMINATOR);
}

fn decode_escaped(data: &[u8]) -> Result<(Vec<u8>, usize), CoreError> {
    let mut out = Vec::new();
    let mut i = 0usize;
    loop {
        let b = *data
            .get(i)
            .ok_or_else(|| CoreError::Decode("unterminated escaped bytes".into()))?;
        if b == 0x00 {
            let next = *data
                .get(i + 1)
                .ok_or_else(|| CoreError::Decode("unterminated escaped bytes".into()))?;
            match next {
                TERMINATOR => return Ok((out, i + 2)),
                ESCAPE => {
                    out.push(0x00);
                    i += 2;
                }
                other => {
                    return Err(CoreError::Decode(format!(
                        "bad escape sequence 0x00 {other:#x}"
                    )))
                }
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
}

fn flip_f32(v: f32) -> u32 {
    let bits = if v.is_nan() { f32::NAN.to_bits() } else { v.to_bits() };
    if bits & 0x8000_0000 == 0 {
        bits | 0x8000_0000
    } else {
        !bits
    }
}

fn unflip_f32(raw: u32) -> f32 {
    let bits = if raw & 0x8000_0000 != 0 {
        raw ^ 0x8000_0000
    } else {
        !raw
    };
    f32::from_bits(bits)
}

fn flip_f64(v: f64) -> u64 {
    let bits = if v.is_nan() { f64::NAN.to_bits() } else { v.to_bits() };
    if bits & 0x8000_0000_0000_0000 == 0 {
        bits | 0x8000_0000_0000_0000
    } else {
        !bits
    }
}

fn unflip_f64(raw: u64) -> f64 {
    let bits = if raw & 0x8000_0000_0000_0000 != 0 {
        raw ^ 0x8000_0000_0000_0000
    } else {
        !raw
    };
    f64::from_bits(bits)
}
