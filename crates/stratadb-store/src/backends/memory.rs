//! In-process model of the record store and commit manager.
//!
//! `MemoryStore` implements the full [`RecordStore`] contract — version
//! chains, snapshot visibility, write-write conflict rejection, CAS on
//! non-transactional tables and server-side scan evaluation — so the
//! coordinator and its tests run against the same semantics a remote
//! deployment provides.
//!
//! Version chains keep every write until the writer's version is reverted;
//! there is no background vacuuming. That is deliberate: reverts during
//! rollback must always find the versions they are undoing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use stratadb_core::{decode_tuple, encode_tuple, Schema, TableId, TableKind, Tuple};

use crate::engine::{Record, RecordStore, StoreError, StoreResult, TableInfo};
use crate::scan::{
    aggregation_schema, parse_aggregation, parse_projection, projected_schema, AggregationOp,
    ParsedSelection, ScanKind,
};
use crate::snapshot::{Snapshot, TransactionType};

/// One version of a record; `data == None` marks a delete.
#[derive(Debug, Clone)]
struct VersionEntry {
    version: u64,
    data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct MemTable {
    id: TableId,
    name: String,
    kind: TableKind,
    /// Schema as the wire ships it: an opaque blob, decoded on `get_table`.
    schema_blob: Vec<u8>,
    schema: Arc<Schema>,
    rows: BTreeMap<u64, Vec<VersionEntry>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_table_id: u64,
    next_version: u64,
    active: BTreeSet<u64>,
    /// Per active snapshot: the versions that were in flight when it
    /// started and therefore stay invisible to it even once committed.
    /// This is the commit manager's bookkeeping, held server-side.
    read_views: HashMap<u64, BTreeSet<u64>>,
    by_name: HashMap<String, u64>,
    tables: HashMap<u64, MemTable>,
}

/// An in-memory record store with commit-manager semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_table_id: 1,
                next_version: 1,
                ..Inner::default()
            }),
        }
    }
}

impl Inner {
    fn table(&self, id: TableId) -> StoreResult<&MemTable> {
        self.tables
            .get(&id.0)
            .ok_or_else(|| StoreError::UnknownTable(id.to_string()))
    }

    fn table_mut(&mut self, id: TableId) -> StoreResult<&mut MemTable> {
        self.tables
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::UnknownTable(id.to_string()))
    }

    fn view(&self, at_version: u64) -> ReadView {
        ReadView {
            invisible: self
                .read_views
                .get(&at_version)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// The set of versions one snapshot must not observe.
#[derive(Debug, Default, Clone)]
struct ReadView {
    invisible: BTreeSet<u64>,
}

impl ReadView {
    fn sees(&self, at: u64, version: u64) -> bool {
        version == at || (version <= at && !self.invisible.contains(&version))
    }
}

impl MemTable {
    fn newest(&self, key: u64) -> Option<&VersionEntry> {
        self.rows.get(&key).and_then(|chain| chain.last())
    }

    /// Newest entry visible at `at` under `view`, plus whether it heads
    /// the chain.
    fn visible(&self, key: u64, at: u64, view: &ReadView) -> Option<(&VersionEntry, bool)> {
        let chain = self.rows.get(&key)?;
        let idx = chain.iter().rposition(|e| view.sees(at, e.version))?;
        Some((&chain[idx], idx + 1 == chain.len()))
    }

    /// Write-write conflict check for a transactional write at `version`:
    /// the chain head must be the writer's own work or visible to it.
    fn head_conflicts(&self, key: u64, version: u64, view: &ReadView) -> bool {
        self.newest(key)
            .is_some_and(|head| !view.sees(version, head.version))
    }
}

impl RecordStore for MemoryStore {
    fn create_table(&self, name: &str, schema: Schema) -> StoreResult<TableInfo> {
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(name) {
            return Err(StoreError::TableExists(name.to_owned()));
        }
        let id = inner.next_table_id;
        inner.next_table_id += 1;
        let schema_blob = bincode::serde::encode_to_vec(&schema, bincode::config::standard())
            .map_err(|e| StoreError::Decode(format!("schema encode: {e}")))?;
        let table = MemTable {
            id: TableId(id),
            name: name.to_owned(),
            kind: schema.kind(),
            schema_blob,
            schema: Arc::new(schema),
            rows: BTreeMap::new(),
        };
        let info = TableInfo {
            id: table.id,
            name: table.name.clone(),
            schema: Arc::clone(&table.schema),
        };
        inner.by_name.insert(name.to_owned(), id);
        inner.tables.insert(id, table);
        debug!(table = name, id, "created table");
        Ok(info)
    }

    fn get_table(&self, name: &str) -> StoreResult<Option<TableInfo>> {
        let inner = self.inner.read();
        let Some(id) = inner.by_name.get(name) else {
            return Ok(None);
        };
        let table = &inner.tables[id];
        // Decode from the blob, the way a wire client would.
        let (schema, _): (Schema, _) =
            bincode::serde::decode_from_slice(&table.schema_blob, bincode::config::standard())
                .map_err(|e| StoreError::Decode(format!("schema decode: {e}")))?;
        Ok(Some(TableInfo {
            id: table.id,
            name: table.name.clone(),
            schema: Arc::new(schema),
        }))
    }

    fn start_transaction(&self, _ty: TransactionType) -> StoreResult<Snapshot> {
        let mut inner = self.inner.write();
        let version = inner.next_version;
        inner.next_version += 1;
        let invisible = inner.active.clone();
        inner.active.insert(version);
        inner.read_views.insert(version, invisible);
        let lowest = *inner.active.first().expect("just inserted");
        Ok(Snapshot::new(version, lowest))
    }

    fn commit(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.active.remove(&snapshot.version);
        inner.read_views.remove(&snapshot.version);
        debug!(version = snapshot.version, "released snapshot");
        Ok(())
    }

    fn get(&self, table: TableId, key: u64, at_version: u64) -> StoreResult<Option<Record>> {
        let inner = self.inner.read();
        let view = inner.view(at_version);
        let t = inner.table(table)?;
        match t.visible(key, at_version, &view) {
            Some((entry, is_newest)) => Ok(entry.data.as_ref().map(|data| Record {
                data: data.clone(),
                version: entry.version,
                is_newest,
            })),
            None => Ok(None),
        }
    }

    fn insert(&self, table: TableId, key: u64, version: u64, data: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let view = inner.view(version);
        let t = inner.table_mut(table)?;
        match t.kind {
            TableKind::Transactional => {
                if t.head_conflicts(key, version, &view) {
                    return Err(StoreError::NotInSnapshot);
                }
                if t.newest(key).is_some_and(|e| e.data.is_some()) {
                    return Err(StoreError::InvalidWrite);
                }
                t.rows.entry(key).or_default().push(VersionEntry {
                    version,
                    data: Some(data.to_vec()),
                });
            }
            TableKind::NonTransactional => {
                if t.rows.contains_key(&key) {
                    return Err(StoreError::InvalidWrite);
                }
                t.rows.insert(
                    key,
                    vec![VersionEntry {
                        version: 1,
                        data: Some(data.to_vec()),
                    }],
                );
            }
        }
        Ok(())
    }

    fn update(
        &self,
        table: TableId,
        key: u64,
        expected_version: u64,
        data: &[u8],
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let view = inner.view(expected_version);
        let t = inner.table_mut(table)?;
        let Some(newest) = t.newest(key) else {
            return Err(StoreError::InvalidWrite);
        };
        if newest.data.is_none() {
            return Err(StoreError::InvalidWrite);
        }
        match t.kind {
            TableKind::Transactional => {
                if t.head_conflicts(key, expected_version, &view) {
                    return Err(StoreError::NotInSnapshot);
                }
                t.rows.entry(key).or_default().push(VersionEntry {
                    version: expected_version,
                    data: Some(data.to_vec()),
                });
            }
            TableKind::NonTransactional => {
                // Strict compare-and-swap.
                if newest.version != expected_version {
                    return Err(StoreError::NotInSnapshot);
                }
                let next = VersionEntry {
                    version: expected_version + 1,
                    data: Some(data.to_vec()),
                };
                t.rows.insert(key, vec![next]);
            }
        }
        Ok(())
    }

    fn remove(&self, table: TableId, key: u64, expected_version: u64) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let view = inner.view(expected_version);
        let t = inner.table_mut(table)?;
        let Some(newest) = t.newest(key) else {
            return Err(StoreError::InvalidWrite);
        };
        if newest.data.is_none() {
            return Err(StoreError::InvalidWrite);
        }
        match t.kind {
            TableKind::Transactional => {
                if t.head_conflicts(key, expected_version, &view) {
                    return Err(StoreError::NotInSnapshot);
                }
                t.rows.entry(key).or_default().push(VersionEntry {
                    version: expected_version,
                    data: None,
                });
            }
            TableKind::NonTransactional => {
                // Removes accept any expected version at or above the
                // current one, so ANY_VERSION acts as a wildcard.
                if newest.version > expected_version {
                    return Err(StoreError::NotInSnapshot);
                }
                t.rows.remove(&key);
            }
        }
        Ok(())
    }

    fn revert(&self, table: TableId, key: u64, version: u64) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let t = inner.table_mut(table)?;
        if let Some(chain) = t.rows.get_mut(&key) {
            chain.retain(|e| e.version != version);
            if chain.is_empty() {
                t.rows.remove(&key);
            }
        }
        Ok(())
    }

    fn scan(
        &self,
        table: TableId,
        snapshot: &Snapshot,
        memory: usize,
        kind: ScanKind,
        selection: &[u8],
        query: &[u8],
    ) -> StoreResult<Vec<Vec<u8>>> {
        let inner = self.inner.read();
        let view = inner.view(snapshot.version);
        let t = inner.table(table)?;
        let schema = Arc::clone(&t.schema);
        let parsed = ParsedSelection::parse(&schema, selection)?;

        let mut visible = Vec::new();
        for (&key, _) in &t.rows {
            if let Some((entry, _)) = t.visible(key, snapshot.version, &view) {
                if let Some(data) = &entry.data {
                    let tuple = decode_tuple(Arc::clone(&schema), data)
                        .map_err(|e| StoreError::Decode(e.to_string()))?;
                    if parsed.matches(key, &tuple) {
                        visible.push((data, tuple));
                    }
                }
            }
        }

        let mut out = Vec::new();
        let mut used = 0usize;
        let mut push = |bytes: Vec<u8>| -> StoreResult<()> {
            used += bytes.len();
            if used > memory {
                return Err(StoreError::ScanMemoryExceeded { budget: memory });
            }
            out.push(bytes);
            Ok(())
        };

        match kind {
            ScanKind::Full => {
                for (data, _) in visible {
                    push(data.clone())?;
                }
            }
            ScanKind::Projection => {
                let columns = parse_projection(query)?;
                let out_schema = Arc::new(projected_schema(&schema, &columns)?);
                for (_, tuple) in visible {
                    // The projected schema re-partitions fixed and
                    // variable fields, so match columns by name.
                    let values = out_schema
                        .fields()
                        .iter()
                        .map(|def| tuple.get_named(&def.name).map(Clone::clone))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| StoreError::Decode(e.to_string()))?;
                    let projected = Tuple::from_values(Arc::clone(&out_schema), values)
                        .map_err(|e| StoreError::Decode(e.to_string()))?;
                    push(encode_tuple(&projected).map_err(|e| StoreError::Decode(e.to_string()))?)?;
                }
            }
            ScanKind::Aggregation => {
                let aggs = parse_aggregation(query)?;
                let out_schema = Arc::new(aggregation_schema(&schema, &aggs)?);
                let mut acc = Tuple::new(Arc::clone(&out_schema));
                for (i, (op, col)) in aggs.iter().enumerate() {
                    let id = stratadb_core::FieldId(i as u16);
                    let mut current = stratadb_core::FieldValue::Null;
                    for (_, tuple) in &visible {
                        let field = tuple
                            .get(*col)
                            .map_err(|e| StoreError::Decode(e.to_string()))?;
                        current = fold_aggregate(*op, current, field, out_schema.fields()[i].field_type)
                            .map_err(|e| StoreError::Decode(e.to_string()))?;
                    }
                    if *op == AggregationOp::Count && current.is_null() {
                        current = stratadb_core::FieldValue::BigInt(0);
                    }
                    acc.set(id, current)
                        .map_err(|e| StoreError::Decode(e.to_string()))?;
                }
                push(encode_tuple(&acc).map_err(|e| StoreError::Decode(e.to_string()))?)?;
            }
        }
        Ok(out)
    }
}

fn fold_aggregate(
    op: AggregationOp,
    acc: stratadb_core::FieldValue,
    field: &stratadb_core::FieldValue,
    out_type: stratadb_core::FieldType,
) -> Result<stratadb_core::FieldValue, stratadb_core::CoreError> {
    use stratadb_core::FieldValue;
    if field.is_null() {
        return Ok(acc);
    }
    Ok(match op {
        AggregationOp::Min => {
            if acc.is_null() || field.try_lt(&acc)? {
                field.clone()
            } else {
                acc
            }
        }
        AggregationOp::Max => {
            if acc.is_null() || acc.try_lt(field)? {
                field.clone()
            } else {
                acc
            }
        }
        AggregationOp::Sum => {
            let widened = field.cast(out_type)?;
            if acc.is_null() {
                widened
            } else {
                acc.try_add(&widened)?
            }
        }
        AggregationOp::Count => match acc {
            FieldValue::Null => FieldValue::BigInt(1),
            FieldValue::BigInt(n) => FieldValue::BigInt(n + 1),
            other => other,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{PredicateOp, SelectionWriter};
    use stratadb_core::{FieldType, FieldValue};

    fn store_with_table() -> (MemoryStore, TableInfo, Arc<Schema>) {
        let store = MemoryStore::new();
        let schema = Schema::builder(TableKind::Transactional)
            .field("n", FieldType::Int, true)
            .build()
            .unwrap();
        let info = store.create_table("t", schema).unwrap();
        let schema = Arc::clone(&info.schema);
        (store, info, schema)
    }

    fn row(schema: &Arc<Schema>, n: i32) -> Vec<u8> {
        let t = Tuple::from_named(Arc::clone(schema), [("n", FieldValue::Int(n))]).unwrap();
        encode_tuple(&t).unwrap()
    }

    #[test]
    fn insert_then_get_at_snapshot() {
        let (store, info, schema) = store_with_table();
        let s1 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.insert(info.id, 7, s1.version, &row(&schema, 1)).unwrap();
        store.commit(&s1).unwrap();

        let s2 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        let rec = store.get(info.id, 7, s2.version).unwrap().unwrap();
        assert!(rec.is_newest);
        assert_eq!(rec.version, s1.version);
    }

    #[test]
    fn old_snapshot_does_not_see_new_write() {
        let (store, info, schema) = store_with_table();
        let old = store.start_transaction(TransactionType::ReadWrite).unwrap();
        let new = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.insert(info.id, 1, new.version, &row(&schema, 1)).unwrap();
        assert!(store.get(info.id, 1, old.version).unwrap().is_none());
        assert!(store.get(info.id, 1, new.version).unwrap().is_some());
    }

    #[test]
    fn concurrent_update_conflicts() {
        let (store, info, schema) = store_with_table();
        let setup = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.insert(info.id, 7, setup.version, &row(&schema, 0)).unwrap();
        store.commit(&setup).unwrap();

        let t1 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        let t2 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.update(info.id, 7, t1.version, &row(&schema, 1)).unwrap();
        // t2 started while t1 was active, so t1's write stays invisible to
        // it and t2's own write loses regardless of version order.
        let err = store.update(info.id, 7, t2.version, &row(&schema, 2));
        assert!(matches!(err, Err(StoreError::NotInSnapshot)));
    }

    #[test]
    fn conflict_survives_first_committer() {
        let (store, info, schema) = store_with_table();
        let setup = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.insert(info.id, 7, setup.version, &row(&schema, 0)).unwrap();
        store.commit(&setup).unwrap();

        let t1 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        let t2 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.update(info.id, 7, t1.version, &row(&schema, 1)).unwrap();
        store.commit(&t1).unwrap();
        // Even after t1 committed, t2's snapshot predates it.
        let err = store.update(info.id, 7, t2.version, &row(&schema, 2));
        assert!(matches!(err, Err(StoreError::NotInSnapshot)));
    }

    #[test]
    fn insert_over_live_record_is_invalid() {
        let (store, info, schema) = store_with_table();
        let s = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.insert(info.id, 1, s.version, &row(&schema, 1)).unwrap();
        let err = store.insert(info.id, 1, s.version, &row(&schema, 2));
        assert!(matches!(err, Err(StoreError::InvalidWrite)));
    }

    #[test]
    fn revert_restores_previous_version() {
        let (store, info, schema) = store_with_table();
        let s1 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.insert(info.id, 1, s1.version, &row(&schema, 1)).unwrap();
        store.commit(&s1).unwrap();

        let s2 = store.start_transaction(TransactionType::ReadWrite).unwrap();
        store.update(info.id, 1, s2.version, &row(&schema, 2)).unwrap();
        store.revert(info.id, 1, s2.version).unwrap();
        let rec = store.get(info.id, 1, s2.version).unwrap().unwrap();
        assert_eq!(rec.version, s1.version);
    }

    #[test]
    fn non_transactional_cas() {
        let store = MemoryStore::new();
        let schema = Schema::builder(TableKind::NonTransactional)
            .field("v", FieldType::BigInt, true)
            .build()
            .unwrap();
        let info = store.create_table("ptrs", schema).unwrap();
        let schema = Arc::clone(&info.schema);
        let payload = |v: i64| {
            let t = Tuple::from_named(Arc::clone(&schema), [("v", FieldValue::BigInt(v))]).unwrap();
            encode_tuple(&t).unwrap()
        };

        store.insert(info.id, 1, 0, &payload(10)).unwrap();
        let rec = store.get(info.id, 1, u64::MAX).unwrap().unwrap();
        assert_eq!(rec.version, 1);

        // CAS with the right version succeeds, bumping it.
        store.update(info.id, 1, 1, &payload(20)).unwrap();
        // Stale CAS loses.
        assert!(matches!(
            store.update(info.id, 1, 1, &payload(30)),
            Err(StoreError::NotInSnapshot)
        ));
        // Wildcard remove.
        store.remove(info.id, 1, crate::engine::ANY_VERSION).unwrap();
        assert!(store.get(info.id, 1, u64::MAX).unwrap().is_none());
    }

    #[test]
    fn full_scan_respects_selection() {
        let (store, info, schema) = store_with_table();
        let s = store.start_transaction(TransactionType::ReadWrite).unwrap();
        for i in 0..10 {
            store
                .insert(info.id, i, s.version, &row(&schema, i as i32))
                .unwrap();
        }
        store.commit(&s).unwrap();

        let reader = store.start_transaction(TransactionType::Analytical).unwrap();
        let mut w = SelectionWriter::new(1);
        w.predicate(0, stratadb_core::FieldId(0), PredicateOp::GreaterEqual, FieldValue::Int(6));
        let records = store
            .scan(info.id, &reader, 1 << 20, ScanKind::Full, &w.finish(), &[])
            .unwrap();
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn aggregation_scan() {
        let (store, info, schema) = store_with_table();
        let s = store.start_transaction(TransactionType::ReadWrite).unwrap();
        for i in 1..=4 {
            store
                .insert(info.id, i, s.version, &row(&schema, i as i32))
                .unwrap();
        }
        store.commit(&s).unwrap();

        let reader = store.start_transaction(TransactionType::Analytical).unwrap();
        let aggs = vec![
            (AggregationOp::Sum, stratadb_core::FieldId(0)),
            (AggregationOp::Max, stratadb_core::FieldId(0)),
            (AggregationOp::Count, stratadb_core::FieldId(0)),
        ];
        let query = crate::scan::serialize_aggregation(&aggs);
        let records = store
            .scan(info.id, &reader, 1 << 20, ScanKind::Aggregation, &[], &query)
            .unwrap();
        assert_eq!(records.len(), 1);
        let out_schema = Arc::new(aggregation_schema(&schema, &aggs).unwrap());
        let t = decode_tuple(out_schema, &records[0]).unwrap();
        assert_eq!(t.get_named("sum_n").unwrap(), &FieldValue::BigInt(10));
        assert_eq!(t.get_named("max_n").unwrap(), &FieldValue::Int(4));
        assert_eq!(t.get_named("cnt_n").unwrap(), &FieldValue::BigInt(4));
    }

    #[test]
    fn scan_memory_budget_enforced() {
        let (store, info, schema) = store_with_table();
        let s = store.start_transaction(TransactionType::ReadWrite).unwrap();
        for i in 0..100 {
            store
                .insert(info.id, i, s.version, &row(&schema, i as i32))
                .unwrap();
        }
        store.commit(&s).unwrap();
        let reader = store.start_transaction(TransactionType::Analytical).unwrap();
        let err = store.scan(info.id, &reader, 64, ScanKind::Full, &[], &[]);
        assert!(matches!(err, Err(StoreError::ScanMemoryExceeded { .. })));
    }
}
