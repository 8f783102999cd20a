//! The scan query surface.
//!
//! Analytical transactions push selection, projection and aggregation
//! down to the store. A [`ScanQuery`] gathers the pieces — the output
//! shape plus a selection in disjunctive normal form — checks them
//! against the schema, and serializes the two wire envelopes.

use std::sync::Arc;

use stratadb_core::{decode_tuple, FieldId, FieldType, FieldValue, Schema, TableId, Tuple};
use stratadb_store::{
    aggregation_schema, projected_schema, AggregationOp, PredicateOp, ScanKind, SelectionWriter,
};

use crate::error::{TransactionError, TxResult};

/// One conjunction of predicates; a row matches a query when it matches
/// any of the query's conjuncts.
#[derive(Debug, Clone, Default)]
pub struct Conjunct {
    predicates: Vec<(PredicateOp, FieldId, FieldValue)>,
}

impl Conjunct {
    /// An empty conjunct.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate; all of a conjunct's predicates must hold.
    #[must_use]
    pub fn and(mut self, column: FieldId, op: PredicateOp, value: FieldValue) -> Self {
        self.predicates.push((op, column, value));
        self
    }

    /// The conjunct's predicates.
    #[must_use]
    pub fn predicates(&self) -> &[(PredicateOp, FieldId, FieldValue)] {
        &self.predicates
    }
}

#[derive(Debug, Clone)]
enum QueryData {
    Full,
    Projection(Vec<FieldId>),
    Aggregation(Vec<(AggregationOp, FieldId)>),
}

/// A pushed-down scan over one table.
#[derive(Debug, Clone)]
pub struct ScanQuery {
    table: TableId,
    data: QueryData,
    conjuncts: Vec<Conjunct>,
    partition: Option<(u16, u32, u32)>,
}

impl ScanQuery {
    /// A full scan returning whole records.
    #[must_use]
    pub fn full(table: TableId) -> Self {
        Self {
            table,
            data: QueryData::Full,
            conjuncts: Vec::new(),
            partition: None,
        }
    }

    /// A projection of the given columns.
    #[must_use]
    pub fn projection(table: TableId, columns: Vec<FieldId>) -> Self {
        Self {
            table,
            data: QueryData::Projection(columns),
            conjuncts: Vec::new(),
            partition: None,
        }
    }

    /// An aggregation returning one record of aggregate values.
    #[must_use]
    pub fn aggregation(table: TableId, aggregations: Vec<(AggregationOp, FieldId)>) -> Self {
        Self {
            table,
            data: QueryData::Aggregation(aggregations),
            conjuncts: Vec::new(),
            partition: None,
        }
    }

    /// Adds a conjunct to the selection.
    #[must_use]
    pub fn or_where(mut self, conjunct: Conjunct) -> Self {
        self.conjuncts.push(conjunct);
        self
    }

    /// Restricts the scan to rows whose key satisfies
    /// `(key >> key_shift) % partition_key == partition_value`.
    pub fn set_partition(&mut self, key_shift: u16, partition_key: u32, partition_value: u32) {
        self.partition = Some((key_shift, partition_key, partition_value));
    }

    /// The scanned table.
    #[must_use]
    pub const fn table(&self) -> TableId {
        self.table
    }

    /// Checks predicates and aggregations against the schema before any
    /// bytes go on the wire.
    pub fn verify(&self, schema: &Schema) -> TxResult<()> {
        for conjunct in &self.conjuncts {
            for (op, column, value) in &conjunct.predicates {
                let def = schema
                    .field(*column)
                    .ok_or_else(|| TransactionError::FieldDoesNotExist(format!("#{}", column.0)))?;
                let needs_value =
                    !matches!(op, PredicateOp::IsNull | PredicateOp::IsNotNull);
                if needs_value && value.field_type() != def.field_type {
                    return Err(TransactionError::WrongFieldType(def.name.clone()));
                }
            }
        }
        if let QueryData::Aggregation(aggs) = &self.data {
            for (_, column) in aggs {
                let def = schema
                    .field(*column)
                    .ok_or_else(|| TransactionError::FieldDoesNotExist(format!("#{}", column.0)))?;
                if matches!(def.field_type, FieldType::Text | FieldType::Blob) {
                    return Err(TransactionError::WrongFieldType(def.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// The schema of the records this scan returns.
    pub fn result_schema(&self, schema: &Arc<Schema>) -> TxResult<Arc<Schema>> {
        Ok(match &self.data {
            QueryData::Full => Arc::clone(schema),
            QueryData::Projection(columns) => Arc::new(projected_schema(schema, columns)?),
            QueryData::Aggregation(aggs) => Arc::new(aggregation_schema(schema, aggs)?),
        })
    }

    /// Serializes the wire envelopes: `(kind, selection, query)`.
    #[must_use]
    pub fn serialize(&self) -> (ScanKind, Vec<u8>, Vec<u8>) {
        let kind = match &self.data {
            QueryData::Full => ScanKind::Full,
            QueryData::Projection(_) => ScanKind::Projection,
            QueryData::Aggregation(_) => ScanKind::Aggregation,
        };
        let query = match &self.data {
            QueryData::Full => Vec::new(),
            QueryData::Projection(columns) => stratadb_store::serialize_projection(columns),
            QueryData::Aggregation(aggs) => stratadb_store::serialize_aggregation(aggs),
        };
        let mut writer = SelectionWriter::new(self.conjuncts.len() as u16);
        for (i, conjunct) in self.conjuncts.iter().enumerate() {
            for (op, column, value) in &conjunct.predicates {
                writer.predicate(i as u8, *column, *op, value.clone());
            }
        }
        if let Some((shift, key, value)) = self.partition {
            writer.partition(shift, key, value);
        }
        (kind, writer.finish(), query)
    }
}

/// The records a scan returned, with the schema to decode them.
#[derive(Debug)]
pub struct ScanResult {
    schema: Arc<Schema>,
    records: Vec<Vec<u8>>,
}

impl ScanResult {
    pub(crate) fn new(schema: Arc<Schema>, records: Vec<Vec<u8>>) -> Self {
        Self { schema, records }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the scan matched nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The output schema (projected or aggregated for those scan kinds).
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The raw record payloads.
    #[must_use]
    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }

    /// Decodes every record.
    pub fn tuples(&self) -> TxResult<Vec<Tuple>> {
        self.records
            .iter()
            .map(|data| Ok(decode_tuple(Arc::clone(&self.schema), data)?))
            .collect()
    }
}
