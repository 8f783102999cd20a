//! Rollback semantics: explicit, implicit on drop, and type checks.

use stratadb::{FieldValue, RowKey, TransactionError, TransactionType, Tuple};

use crate::common::{foo_bar_schema, indexed_schema, manager};

#[test]
fn explicit_rollback_discards_inserts() {
    let manager = manager();

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        tx.create_table("rb", foo_bar_schema())?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("rb")?;
        let schema = tx.schema(table)?;
        for i in 0i32..=9 {
            let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(i))])?;
            tx.insert(table, RowKey(i as u64), row)?;
        }
        tx.rollback()
    });
    fiber.wait().expect("rollback failed");

    let check = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("rb")?;
        assert!(matches!(
            tx.get(table, RowKey(5)),
            Err(TransactionError::TupleDoesNotExist(RowKey(5)))
        ));
        tx.commit()
    });
    check.wait().expect("check failed");
}

#[test]
fn dropping_without_commit_rolls_back() {
    let manager = manager();

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        tx.create_table("drop_rb", foo_bar_schema())?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("drop_rb")?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(1))])?;
        tx.insert(table, RowKey(1), row)?;
        // Returning without commit: the transaction unwinds on drop.
        Ok(())
    });
    fiber.wait().expect("fiber failed");

    let check = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("drop_rb")?;
        assert!(tx.get(table, RowKey(1)).is_err());
        tx.commit()
    });
    check.wait().expect("check failed");
}

#[test]
fn rollback_also_unwinds_index_entries() {
    let manager = manager();

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        tx.create_table("rb_idx", indexed_schema("rbi"))?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("rb_idx")?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(5))])?;
        tx.insert(table, RowKey(1), row)?;
        tx.rollback()
    });
    fiber.wait().expect("rollback failed");

    // The index key is free again: the same key inserts cleanly.
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("rb_idx")?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(5))])?;
        tx.insert(table, RowKey(2), row)?;
        tx.commit()
    });
    fiber.wait().expect("reinsert failed");
}

#[test]
fn read_only_transaction_refuses_staged_changes() {
    let manager = manager();

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        tx.create_table("ro", foo_bar_schema())?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    let fiber = manager.start_transaction(TransactionType::ReadOnly, |mut tx, _| {
        let table = tx.open_table("ro")?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(1))])?;
        tx.insert(table, RowKey(1), row)?;
        match tx.commit() {
            Err(TransactionError::ReadOnly) => Ok(()),
            other => panic!("expected ReadOnly, got {other:?}"),
        }
    });
    fiber.wait().expect("fiber failed");
}
