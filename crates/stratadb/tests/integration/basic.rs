//! Basic round trips: insert, commit, read back in a fresh transaction.

use stratadb::{FieldValue, RowKey, TransactionError, TransactionType, Tuple};

use crate::common::{foo_bar_schema, manager};

#[test]
fn insert_commit_read_back() {
    let manager = manager();

    // Populate: keys 0..=99, bar null on every fifth row.
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("foo", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        for i in 0i32..=99 {
            let bar = if i % 5 == 0 {
                FieldValue::Null
            } else {
                FieldValue::Text("foobar".into())
            };
            let row = Tuple::from_named(
                schema.clone(),
                [("foo", FieldValue::Int(i)), ("bar", bar)],
            )?;
            tx.insert(table, RowKey(i as u64), row)?;
        }
        tx.commit()
    });
    fiber.wait().expect("populate failed");

    // Read back in a fresh transaction.
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("foo")?;
        for i in 0i32..=99 {
            let tuple = tx.get(table, RowKey(i as u64))?;
            assert_eq!(tuple.get_named("foo")?, &FieldValue::Int(i));
            if i % 5 == 0 {
                assert!(tuple.get_named("bar")?.is_null());
            } else {
                assert_eq!(tuple.get_named("bar")?, &FieldValue::Text("foobar".into()));
            }
        }
        tx.commit()
    });
    fiber.wait().expect("read back failed");
}

#[test]
fn read_your_writes_before_commit() {
    let manager = manager();
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("ryw", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(7))])?;
        tx.insert(table, RowKey(1), row)?;

        // Visible before any commit.
        let staged = tx.get(table, RowKey(1))?;
        assert_eq!(staged.get_named("foo")?, &FieldValue::Int(7));

        // An update is immediately visible too.
        let from = staged.clone();
        let to = from.with("foo", FieldValue::Int(8))?;
        tx.update(table, RowKey(1), &from, to)?;
        assert_eq!(
            tx.get(table, RowKey(1))?.get_named("foo")?,
            &FieldValue::Int(8)
        );

        // And a remove hides the key from this transaction.
        let gone = tx.get(table, RowKey(1))?.clone();
        tx.remove(table, RowKey(1), &gone)?;
        assert!(matches!(
            tx.get(table, RowKey(1)),
            Err(TransactionError::TupleDoesNotExist(RowKey(1)))
        ));
        tx.commit()
    });
    fiber.wait().expect("fiber failed");
}

#[test]
fn get_of_missing_key_fails() {
    let manager = manager();
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("missing", foo_bar_schema())?;
        assert!(matches!(
            tx.get(table, RowKey(42)),
            Err(TransactionError::TupleDoesNotExist(RowKey(42)))
        ));
        tx.commit()
    });
    fiber.wait().expect("fiber failed");
}

#[test]
fn double_insert_fails() {
    let manager = manager();
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("dup", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(1))])?;
        tx.insert(table, RowKey(9), row.clone())?;
        assert!(matches!(
            tx.insert(table, RowKey(9), row),
            Err(TransactionError::TupleExists(RowKey(9)))
        ));
        tx.commit()
    });
    fiber.wait().expect("fiber failed");
}

#[test]
fn update_then_reopen_sees_new_value() {
    let manager = manager();
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("upd", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(1))])?;
        tx.insert(table, RowKey(1), row)?;
        tx.commit()
    });
    fiber.wait().expect("populate failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("upd")?;
        let from = tx.get(table, RowKey(1))?.clone();
        let to = from.with("foo", FieldValue::Int(2))?;
        tx.update(table, RowKey(1), &from, to)?;
        tx.commit()
    });
    fiber.wait().expect("update failed");

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("upd")?;
        assert_eq!(
            tx.get(table, RowKey(1))?.get_named("foo")?,
            &FieldValue::Int(2)
        );
        tx.commit()
    });
    fiber.wait().expect("read failed");
}
