//! Secondary-index range scans and index maintenance.

use stratadb_core::{FieldType, Schema, TableKind};

use stratadb::{FieldValue, RowKey, TransactionType, Tuple};

use crate::common::{indexed_schema, manager};

#[test]
fn range_scan_over_unique_index() {
    let manager = manager();

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("idx_table", indexed_schema("idx"))?;
        let schema = tx.schema(table)?;
        for i in 0i32..1000 {
            let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(i))])?;
            tx.insert(table, RowKey(i as u64), row)?;
        }
        tx.commit()
    });
    fiber.wait().expect("populate failed");

    // Reopen and walk 200 successive entries from 132.
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("idx_table")?;
        let mut iter = tx.lower_bound(table, "idx", &[FieldValue::Int(132)])?;
        for expected in 132i32..332 {
            let (key, row) = iter.next()?.expect("should not be out of range");
            assert_eq!(key, vec![FieldValue::Int(expected)]);
            assert_eq!(row, RowKey(expected as u64));
        }
        drop(iter);
        tx.commit()
    });
    fiber.wait().expect("scan failed");
}

#[test]
fn staged_inserts_merge_into_iteration() {
    let manager = manager();
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("merge_idx", indexed_schema("midx"))?;
        let schema = tx.schema(table)?;
        // Even keys committed in an earlier transaction would be the
        // usual setup; here everything is staged, which is the harder
        // case for the merged cursor.
        for i in [4i32, 0, 2, 3, 1] {
            let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(i))])?;
            tx.insert(table, RowKey(i as u64), row)?;
        }
        let mut iter = tx.lower_bound(table, "midx", &[FieldValue::Int(0)])?;
        for expected in 0i32..5 {
            let (key, row) = iter.next()?.expect("staged entry");
            assert_eq!(key, vec![FieldValue::Int(expected)]);
            assert_eq!(row, RowKey(expected as u64));
        }
        assert!(iter.next()?.is_none());
        drop(iter);
        tx.commit()
    });
    fiber.wait().expect("fiber failed");
}

#[test]
fn staged_delete_suppresses_tree_entry() {
    let manager = manager();
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("del_idx", indexed_schema("didx"))?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(10))])?;
        tx.insert(table, RowKey(1), row)?;
        tx.commit()
    });
    fiber.wait().expect("populate failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("del_idx")?;
        let doomed = tx.get(table, RowKey(1))?.clone();
        tx.remove(table, RowKey(1), &doomed)?;
        let mut iter = tx.lower_bound(table, "didx", &[FieldValue::Int(0)])?;
        assert!(iter.next()?.is_none());
        drop(iter);
        tx.commit()
    });
    fiber.wait().expect("delete failed");
}

#[test]
fn update_moves_index_entry() {
    let manager = manager();

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("move_idx", indexed_schema("mvidx"))?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(10))])?;
        tx.insert(table, RowKey(1), row)?;
        tx.commit()
    });
    fiber.wait().expect("populate failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("move_idx")?;
        let from = tx.get(table, RowKey(1))?.clone();
        let to = from.with("field", FieldValue::Int(20))?;
        tx.update(table, RowKey(1), &from, to)?;
        tx.commit()
    });
    fiber.wait().expect("update failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("move_idx")?;
        // The old key is gone...
        let mut iter = tx.lower_bound(table, "mvidx", &[FieldValue::Int(10)])?;
        let first = iter.next()?;
        assert_eq!(first, Some((vec![FieldValue::Int(20)], RowKey(1))));
        assert!(iter.next()?.is_none());
        drop(iter);
        // ...and a scan from the new key finds the row.
        let mut iter = tx.lower_bound(table, "mvidx", &[FieldValue::Int(20)])?;
        assert_eq!(iter.next()?, Some((vec![FieldValue::Int(20)], RowKey(1))));
        drop(iter);
        tx.commit()
    });
    fiber.wait().expect("verify failed");
}

#[test]
fn reverse_scan_over_index() {
    let manager = manager();
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("rev_idx", indexed_schema("ridx"))?;
        let schema = tx.schema(table)?;
        for i in 0i32..100 {
            let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(i))])?;
            tx.insert(table, RowKey(i as u64), row)?;
        }
        tx.commit()
    });
    fiber.wait().expect("populate failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("rev_idx")?;
        let mut iter = tx.reverse_lower_bound(table, "ridx", &[FieldValue::Int(49)])?;
        for expected in (0i32..=49).rev() {
            let (key, row) = iter.next()?.expect("entry");
            assert_eq!(key, vec![FieldValue::Int(expected)]);
            assert_eq!(row, RowKey(expected as u64));
        }
        assert!(iter.next()?.is_none());
        drop(iter);
        tx.commit()
    });
    fiber.wait().expect("reverse scan failed");
}

#[test]
fn non_unique_index_returns_all_rows() {
    let manager = manager();
    let schema = Schema::builder(TableKind::Transactional)
        .field("grp", FieldType::Int, true)
        .index("by_grp", false, &["grp"])
        .build()
        .expect("schema");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, move |mut tx, _| {
        let table = tx.create_table("groups", schema)?;
        let tschema = tx.schema(table)?;
        // Three rows in group 5, one in group 6.
        for (key, grp) in [(1u64, 5i32), (2, 5), (3, 5), (4, 6)] {
            let row = Tuple::from_named(tschema.clone(), [("grp", FieldValue::Int(grp))])?;
            tx.insert(table, RowKey(key), row)?;
        }
        tx.commit()
    });
    fiber.wait().expect("populate failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("groups")?;
        let mut iter = tx.lower_bound(table, "by_grp", &[FieldValue::Int(5)])?;
        let mut group5 = Vec::new();
        while let Some((key, row)) = iter.next()? {
            if key == vec![FieldValue::Int(5)] {
                group5.push(row.0);
            } else {
                assert_eq!(key, vec![FieldValue::Int(6)]);
                assert_eq!(row, RowKey(4));
            }
        }
        group5.sort_unstable();
        assert_eq!(group5, vec![1, 2, 3]);
        drop(iter);
        tx.commit()
    });
    fiber.wait().expect("scan failed");
}
