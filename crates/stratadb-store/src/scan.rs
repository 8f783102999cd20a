//! Scan envelope byte formats.
//!
//! A pushed-down scan ships two buffers to the store: a *query* envelope
//! describing the output shape (full records, a projection, or an
//! aggregation) and a *selection* envelope holding the predicate DNF.
//!
//! # Query envelope
//!
//! - Full scan: empty.
//! - Projection: ascending `u16` column ids, 2 bytes each.
//! - Aggregation: `(u16 column id, u16 op)` per aggregate.
//!
//! # Selection envelope
//!
//! Everything is little-endian and 8-byte aligned:
//!
//! ```text
//! header (16 bytes):
//!   u32 column_count | u16 conjunct_count | u16 key_shift
//!   u32 partition_key | u32 partition_value
//! per column (8 bytes + predicates):
//!   u16 column_id | u16 predicate_count | u32 padding
//! per predicate:
//!   u8 op | u8 conjunct_index | value (width per column type, padded)
//! ```
//!
//! 4-byte-or-smaller numerics pack into one 8-byte slot together with the
//! 2-byte predicate head; 8-byte numerics pad the head to 8 and take a
//! second slot. Strings and blobs follow the head with a `u32` length and
//! their bytes, padded to the next 8-byte boundary.
//!
//! A row matches when at least one conjunct has all of its predicates
//! satisfied (or when the selection has no conjuncts at all). The optional
//! partition triple additionally keeps only rows whose key satisfies
//! `(key >> key_shift) % partition_key == partition_value`.

use std::collections::BTreeMap;
use std::sync::Arc;

use stratadb_core::{FieldId, FieldType, FieldValue, Schema, Tuple};

use crate::engine::{StoreError, StoreResult};

/// Output shape of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Every visible record, verbatim.
    Full,
    /// A column subset, re-encoded with the projected schema.
    Projection,
    /// One record of aggregate values.
    Aggregation,
}

/// Comparison operator of a scan predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PredicateOp {
    /// `column == value`
    Equal = 0,
    /// `column != value`
    NotEqual = 1,
    /// `column < value`
    Less = 2,
    /// `column <= value`
    LessEqual = 3,
    /// `column > value`
    Greater = 4,
    /// `column >= value`
    GreaterEqual = 5,
    /// `column IS NULL`
    IsNull = 6,
    /// `column IS NOT NULL`
    IsNotNull = 7,
}

impl PredicateOp {
    fn from_u8(v: u8) -> StoreResult<Self> {
        Ok(match v {
            0 => Self::Equal,
            1 => Self::NotEqual,
            2 => Self::Less,
            3 => Self::LessEqual,
            4 => Self::Greater,
            5 => Self::GreaterEqual,
            6 => Self::IsNull,
            7 => Self::IsNotNull,
            other => return Err(StoreError::Decode(format!("bad predicate op {other}"))),
        })
    }
}

/// Aggregation operator over one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AggregationOp {
    /// Smallest visible value.
    Min = 0,
    /// Largest visible value.
    Max = 1,
    /// Sum of visible values.
    Sum = 2,
    /// Count of non-null visible values.
    Count = 3,
}

impl AggregationOp {
    fn from_u16(v: u16) -> StoreResult<Self> {
        Ok(match v {
            0 => Self::Min,
            1 => Self::Max,
            2 => Self::Sum,
            3 => Self::Count,
            other => return Err(StoreError::Decode(format!("bad aggregation op {other}"))),
        })
    }

    /// Lowercase name, used for derived column names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Count => "cnt",
        }
    }
}

// ---------------------------------------------------------------------------
// Query envelope
// ---------------------------------------------------------------------------

/// Serializes a projection query envelope; column ids are sorted ascending.
#[must_use]
pub fn serialize_projection(columns: &[FieldId]) -> Vec<u8> {
    let mut ids: Vec<u16> = columns.iter().map(|c| c.0).collect();
    ids.sort_unstable();
    let mut buf = Vec::with_capacity(ids.len() * 2);
    for id in ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}

/// Parses a projection envelope.
pub fn parse_projection(data: &[u8]) -> StoreResult<Vec<FieldId>> {
    if data.len() % 2 != 0 {
        return Err(StoreError::Decode("odd projection envelope".into()));
    }
    Ok(data
        .chunks_exact(2)
        .map(|c| FieldId(u16::from_le_bytes([c[0], c[1]])))
        .collect())
}

/// Serializes an aggregation query envelope.
#[must_use]
pub fn serialize_aggregation(aggregations: &[(AggregationOp, FieldId)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(aggregations.len() * 4);
    for (op, col) in aggregations {
        buf.extend_from_slice(&col.0.to_le_bytes());
        buf.extend_from_slice(&(*op as u16).to_le_bytes());
    }
    buf
}

/// Parses an aggregation envelope.
pub fn parse_aggregation(data: &[u8]) -> StoreResult<Vec<(AggregationOp, FieldId)>> {
    if data.len() % 4 != 0 {
        return Err(StoreError::Decode("bad aggregation envelope".into()));
    }
    data.chunks_exact(4)
        .map(|c| {
            let col = FieldId(u16::from_le_bytes([c[0], c[1]]));
            let op = AggregationOp::from_u16(u16::from_le_bytes([c[2], c[3]]))?;
            Ok((op, col))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Selection envelope
// ---------------------------------------------------------------------------

/// Builds a selection envelope.
#[derive(Debug, Default)]
pub struct SelectionWriter {
    conjunct_count: u16,
    by_column: BTreeMap<u16, Vec<(PredicateOp, u8, FieldValue)>>,
    partition: Option<(u16, u32, u32)>,
}

impl SelectionWriter {
    /// Starts an envelope with the given number of conjuncts.
    #[must_use]
    pub fn new(conjunct_count: u16) -> Self {
        Self {
            conjunct_count,
            ..Self::default()
        }
    }

    /// Adds a predicate belonging to one conjunct.
    pub fn predicate(&mut self, conjunct: u8, column: FieldId, op: PredicateOp, value: FieldValue) {
        self.by_column
            .entry(column.0)
            .or_default()
            .push((op, conjunct, value));
    }

    /// Restricts the scan to one key partition.
    pub fn partition(&mut self, key_shift: u16, partition_key: u32, partition_value: u32) {
        self.partition = Some((key_shift, partition_key, partition_value));
    }

    /// Serializes the envelope.
    #[must_use]
    pub fn finish(&self) -> Vec<u8> {
        let (key_shift, pkey, pvalue) = self.partition.unwrap_or((0, 0, 0));
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.by_column.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.conjunct_count.to_le_bytes());
        buf.extend_from_slice(&key_shift.to_le_bytes());
        buf.extend_from_slice(&pkey.to_le_bytes());
        buf.extend_from_slice(&pvalue.to_le_bytes());
        for (column, predicates) in &self.by_column {
            buf.extend_from_slice(&column.to_le_bytes());
            buf.extend_from_slice(&(predicates.len() as u16).to_le_bytes());
            buf.extend_from_slice(&[0u8; 4]);
            for (op, conjunct, value) in predicates {
                write_predicate(&mut buf, *op, *conjunct, value);
            }
        }
        buf
    }
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

fn write_predicate(buf: &mut Vec<u8>, op: PredicateOp, conjunct: u8, value: &FieldValue) {
    buf.push(op as u8);
    buf.push(conjunct);
    match value {
        FieldValue::SmallInt(v) => {
            buf.extend_from_slice(&v.to_le_bytes());
            buf.extend_from_slice(&[0u8; 4]);
        }
        FieldValue::Int(v) => {
            buf.extend_from_slice(&[0u8; 2]);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::Float(v) => {
            buf.extend_from_slice(&[0u8; 2]);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::BigInt(v) => {
            buf.extend_from_slice(&[0u8; 6]);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::Double(v) => {
            buf.extend_from_slice(&[0u8; 6]);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::Text(s) => {
            buf.extend_from_slice(&[0u8; 2]);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            pad_to(buf, 8);
        }
        FieldValue::Blob(b) => {
            buf.extend_from_slice(&[0u8; 2]);
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
            pad_to(buf, 8);
        }
        // IS NULL / IS NOT NULL predicates carry a null value: head padded
        // to one slot, no payload.
        FieldValue::Null => {
            buf.extend_from_slice(&[0u8; 6]);
        }
    }
}

/// A parsed selection envelope, ready for evaluation.
#[derive(Debug, Clone)]
pub struct ParsedSelection {
    conjunct_count: u16,
    key_shift: u16,
    partition_key: u32,
    partition_value: u32,
    columns: Vec<(FieldId, Vec<(PredicateOp, u8, FieldValue)>)>,
}

impl ParsedSelection {
    /// Parses a selection envelope against the scanned table's schema.
    pub fn parse(schema: &Arc<Schema>, data: &[u8]) -> StoreResult<Self> {
        if data.is_empty() {
            return Ok(Self {
                conjunct_count: 0,
                key_shift: 0,
                partition_key: 0,
                partition_value: 0,
                columns: Vec::new(),
            });
        }
        let mut r = Reader::new(data);
        let column_count = r.u32()?;
        let conjunct_count = r.u16()?;
        let key_shift = r.u16()?;
        let partition_key = r.u32()?;
        let partition_value = r.u32()?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let column = FieldId(r.u16()?);
            let predicate_count = r.u16()?;
            r.skip(4)?;
            let field_type = schema
                .field(column)
                .ok_or_else(|| StoreError::Decode(format!("selection on unknown column {column:?}")))?
                .field_type;
            let mut predicates = Vec::with_capacity(predicate_count as usize);
            for _ in 0..predicate_count {
                let op = PredicateOp::from_u8(r.u8()?)?;
                let conjunct = r.u8()?;
                let value = read_predicate_value(&mut r, op, field_type)?;
                predicates.push((op, conjunct, value));
            }
            columns.push((column, predicates));
        }
        Ok(Self {
            conjunct_count,
            key_shift,
            partition_key,
            partition_value,
            columns,
        })
    }

    /// Whether a row passes the selection.
    #[must_use]
    pub fn matches(&self, key: u64, tuple: &Tuple) -> bool {
        if self.partition_key != 0 {
            let part = (key >> self.key_shift) % u64::from(self.partition_key);
            if part != u64::from(self.partition_value) {
                return false;
            }
        }
        if self.conjunct_count == 0 {
            return true;
        }
        // A conjunct passes when all of its predicates pass; the row
        // passes when any conjunct does.
        let mut passes = vec![true; self.conjunct_count as usize];
        for (column, predicates) in &self.columns {
            let Ok(field) = tuple.get(*column) else {
                return false;
            };
            for (op, conjunct, value) in predicates {
                let idx = *conjunct as usize;
                if idx < passes.len() && passes[idx] && !eval_predicate(*op, field, value) {
                    passes[idx] = false;
                }
            }
        }
        passes.iter().any(|p| *p)
    }
}

fn eval_predicate(op: PredicateOp, field: &FieldValue, value: &FieldValue) -> bool {
    use std::cmp::Ordering;
    match op {
        PredicateOp::IsNull => field.is_null(),
        PredicateOp::IsNotNull => !field.is_null(),
        _ => {
            // SQL semantics: comparison with NULL is never true.
            let Ok(ord) = field.try_cmp(value) else {
                return false;
            };
            match op {
                PredicateOp::Equal => ord == Ordering::Equal,
                PredicateOp::NotEqual => ord != Ordering::Equal,
                PredicateOp::Less => ord == Ordering::Less,
                PredicateOp::LessEqual => ord != Ordering::Greater,
                PredicateOp::Greater => ord == Ordering::Greater,
                PredicateOp::GreaterEqual => ord != Ordering::Less,
                PredicateOp::IsNull | PredicateOp::IsNotNull => unreachable!(),
            }
        }
    }
}

fn read_predicate_value(
    r: &mut Reader<'_>,
    op: PredicateOp,
    field_type: FieldType,
) -> StoreResult<FieldValue> {
    if matches!(op, PredicateOp::IsNull | PredicateOp::IsNotNull) {
        r.skip(6)?;
        return Ok(FieldValue::Null);
    }
    Ok(match field_type {
        FieldType::SmallInt => {
            let v = i16::from_le_bytes(r.array::<2>()?);
            r.skip(4)?;
            FieldValue::SmallInt(v)
        }
        FieldType::Int => {
            r.skip(2)?;
            FieldValue::Int(i32::from_le_bytes(r.array::<4>()?))
        }
        FieldType::Float => {
            r.skip(2)?;
            FieldValue::Float(f32::from_le_bytes(r.array::<4>()?))
        }
        FieldType::BigInt => {
            r.skip(6)?;
            FieldValue::BigInt(i64::from_le_bytes(r.array::<8>()?))
        }
        FieldType::Double => {
            r.skip(6)?;
            FieldValue::Double(f64::from_le_bytes(r.array::<8>()?))
        }
        FieldType::Text | FieldType::Blob => {
            r.skip(2)?;
            let len = r.u32()? as usize;
            let bytes = r.bytes(len)?.to_vec();
            r.align(8)?;
            if field_type == FieldType::Text {
                FieldValue::Text(String::from_utf8(bytes).map_err(|e| {
                    StoreError::Decode(format!("invalid UTF-8 in predicate: {e}"))
                })?)
            } else {
                FieldValue::Blob(bytes)
            }
        }
        FieldType::Null => {
            return Err(StoreError::Decode("predicate on NULL-typed column".into()))
        }
    })
}

// ---------------------------------------------------------------------------
// Derived schemas
// ---------------------------------------------------------------------------

/// The schema a projection scan encodes its output with.
pub fn projected_schema(schema: &Schema, columns: &[FieldId]) -> StoreResult<Schema> {
    let mut builder = Schema::builder(schema.kind());
    let mut ids: Vec<u16> = columns.iter().map(|c| c.0).collect();
    ids.sort_unstable();
    for id in ids {
        let def = schema
            .field(FieldId(id))
            .ok_or_else(|| StoreError::Decode(format!("projection of unknown column {id}")))?;
        builder = builder.field(def.name.clone(), def.field_type, def.not_null);
    }
    builder
        .build()
        .map_err(|e| StoreError::Decode(e.to_string()))
}

/// The schema an aggregation scan encodes its single output record with.
///
/// `min`/`max` keep the column type, `sum` widens to BIGINT (or DOUBLE for
/// float columns) and `cnt` is a BIGINT. Aggregates over an empty table
/// are NULL (except `cnt`, which is 0), so every derived field is nullable.
pub fn aggregation_schema(
    schema: &Schema,
    aggregations: &[(AggregationOp, FieldId)],
) -> StoreResult<Schema> {
    let mut builder = Schema::builder(schema.kind());
    for (op, col) in aggregations {
        let def = schema
            .field(*col)
            .ok_or_else(|| StoreError::Decode(format!("aggregation of unknown column {col:?}")))?;
        let field_type = match op {
            AggregationOp::Min | AggregationOp::Max => def.field_type,
            AggregationOp::Sum => match def.field_type {
                FieldType::Float | FieldType::Double => FieldType::Double,
                _ => FieldType::BigInt,
            },
            AggregationOp::Count => FieldType::BigInt,
        };
        builder = builder.field(format!("{}_{}", op.name(), def.name), field_type, false);
    }
    builder
        .build()
        .map_err(|e| StoreError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Little-endian reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        let s = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| StoreError::Decode("selection envelope truncated".into()))?;
        self.pos += n;
        Ok(s)
    }

    fn array<const N: usize>(&mut self) -> StoreResult<[u8; N]> {
        Ok(self.bytes(N)?.try_into().expect("length checked"))
    }

    fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> StoreResult<u16> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> StoreResult<u32> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn skip(&mut self, n: usize) -> StoreResult<()> {
        self.bytes(n).map(|_| ())
    }

    fn align(&mut self, to: usize) -> StoreResult<()> {
        let rem = self.pos % to;
        if rem != 0 {
            self.skip(to - rem)?;
        }
        Ok(())
    }
}
