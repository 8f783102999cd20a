//! Write-write conflicts between overlapping transactions.

use std::sync::Barrier;

use stratadb::{FieldValue, RowKey, TransactionError, TransactionType, Tuple};

use crate::common::{foo_bar_schema, indexed_schema, manager_with};

/// Two fibers rendezvous twice: once after both staged their update (so
/// the snapshots overlap) and once after the winner committed.
struct Gates {
    staged: Barrier,
    committed: Barrier,
}

#[test]
fn concurrent_updates_conflict_on_the_loser() {
    let manager = manager_with(Gates {
        staged: Barrier::new(2),
        committed: Barrier::new(2),
    });

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("contended", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(0))])?;
        tx.insert(table, RowKey(7), row)?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    // The loser: stages its update, lets the winner commit, then tries.
    let loser = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        let table = tx.open_table("contended")?;
        let from = tx.get(table, RowKey(7))?.clone();
        let to = from.with("foo", FieldValue::Int(1))?;
        tx.update(table, RowKey(7), &from, to)?;
        ctx.shared().staged.wait();
        ctx.shared().committed.wait();
        tx.commit()
    });

    // The winner: stages and commits while the loser holds its snapshot.
    let winner = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        let table = tx.open_table("contended")?;
        let from = tx.get(table, RowKey(7))?.clone();
        let to = from.with("foo", FieldValue::Int(2))?;
        tx.update(table, RowKey(7), &from, to)?;
        ctx.shared().staged.wait();
        let result = tx.commit();
        ctx.shared().committed.wait();
        result
    });

    winner.wait().expect("winner should commit");
    match loser.wait() {
        Err(TransactionError::Conflicts(keys)) => assert_eq!(keys, vec![RowKey(7)]),
        other => panic!("expected Conflicts([7]), got {other:?}"),
    }
}

#[test]
fn failed_commit_leaves_committed_state_intact() {
    let manager = manager_with(Gates {
        staged: Barrier::new(2),
        committed: Barrier::new(2),
    });

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("intact", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(0))])?;
        tx.insert(table, RowKey(7), row)?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    let loser = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        let table = tx.open_table("intact")?;
        let from = tx.get(table, RowKey(7))?.clone();
        let to = from.with("foo", FieldValue::Int(100))?;
        tx.update(table, RowKey(7), &from, to)?;
        ctx.shared().staged.wait();
        ctx.shared().committed.wait();
        tx.commit()
    });
    let winner = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        let table = tx.open_table("intact")?;
        let from = tx.get(table, RowKey(7))?.clone();
        let to = from.with("foo", FieldValue::Int(2))?;
        tx.update(table, RowKey(7), &from, to)?;
        ctx.shared().staged.wait();
        let result = tx.commit();
        ctx.shared().committed.wait();
        result
    });
    winner.wait().expect("winner should commit");
    assert!(loser.wait().is_err());

    // The winner's value survived the loser's unwinding.
    let check = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("intact")?;
        assert_eq!(
            tx.get(table, RowKey(7))?.get_named("foo")?,
            &FieldValue::Int(2)
        );
        tx.commit()
    });
    check.wait().expect("check failed");
}

#[test]
fn unique_index_conflict_aborts_commit() {
    let manager = manager_with(Gates {
        staged: Barrier::new(2),
        committed: Barrier::new(2),
    });

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        tx.create_table("uidx", indexed_schema("u"))?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    // Both transactions insert different rows carrying the same unique
    // index key; the tuple writes cannot conflict, the index must.
    let loser = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        let table = tx.open_table("uidx")?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(5))])?;
        tx.insert(table, RowKey(1), row)?;
        ctx.shared().staged.wait();
        ctx.shared().committed.wait();
        tx.commit()
    });
    let winner = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        let table = tx.open_table("uidx")?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("field", FieldValue::Int(5))])?;
        tx.insert(table, RowKey(2), row)?;
        ctx.shared().staged.wait();
        let result = tx.commit();
        ctx.shared().committed.wait();
        result
    });

    winner.wait().expect("winner should commit");
    match loser.wait() {
        Err(TransactionError::IndexConflict { row, index }) => {
            assert_eq!(row, RowKey(1));
            assert_eq!(index, "u");
        }
        other => panic!("expected IndexConflict, got {other:?}"),
    }

    // Only the winner's row exists.
    let check = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("uidx")?;
        assert!(tx.get(table, RowKey(1)).is_err());
        assert!(tx.get(table, RowKey(2)).is_ok());
        tx.commit()
    });
    check.wait().expect("check failed");
}

#[test]
fn stale_read_raises_conflict_locally() {
    let manager = manager_with(Gates {
        staged: Barrier::new(2),
        committed: Barrier::new(2),
    });

    let setup = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("stale", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        let row = Tuple::from_named(schema.clone(), [("foo", FieldValue::Int(0))])?;
        tx.insert(table, RowKey(3), row)?;
        tx.commit()
    });
    setup.wait().expect("setup failed");

    // Reader opens its snapshot, waits for a writer to move the key on,
    // then reads (seeing the old version, flagged non-newest) and tries
    // to update: the conflict fires before any write goes out.
    let reader = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        let table = tx.open_table("stale")?;
        ctx.shared().staged.wait();
        ctx.shared().committed.wait();
        let from = tx.get(table, RowKey(3))?.clone();
        let to = from.with("foo", FieldValue::Int(9))?;
        match tx.update(table, RowKey(3), &from, to) {
            Err(TransactionError::Conflict(RowKey(3))) => tx.commit(),
            other => panic!("expected local Conflict, got {other:?}"),
        }
    });
    let writer = manager.start_transaction(TransactionType::ReadWrite, |mut tx, ctx| {
        ctx.shared().staged.wait();
        let table = tx.open_table("stale")?;
        let from = tx.get(table, RowKey(3))?.clone();
        let to = from.with("foo", FieldValue::Int(1))?;
        tx.update(table, RowKey(3), &from, to)?;
        let result = tx.commit();
        ctx.shared().committed.wait();
        result
    });

    writer.wait().expect("writer should commit");
    reader.wait().expect("reader should observe a local conflict");
}
