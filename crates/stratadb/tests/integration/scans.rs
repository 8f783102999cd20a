//! Pushed-down analytical scans.

use stratadb::{
    AggregationOp, Conjunct, FieldValue, PredicateOp, RowKey, ScanQuery, TransactionError,
    TransactionType, Tuple,
};
use stratadb_core::FieldId;

use crate::common::{foo_bar_schema, manager};

const MEMORY: usize = 1 << 20;

fn populate(manager: &stratadb::ClientManager) {
    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.create_table("scanned", foo_bar_schema())?;
        let schema = tx.schema(table)?;
        for i in 0i32..50 {
            let bar = if i % 2 == 0 {
                FieldValue::Text("even".into())
            } else {
                FieldValue::Null
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
}

#[test]
fn full_scan_with_selection() {
    let manager = manager();
    populate(&manager);

    let fiber = manager.start_transaction(TransactionType::Analytical, |mut tx, _| {
        let table = tx.open_table("scanned")?;
        let query = ScanQuery::full(table).or_where(
            Conjunct::new().and(FieldId(0), PredicateOp::GreaterEqual, FieldValue::Int(40)),
        );
        let result = tx.scan(&query, MEMORY)?;
        assert_eq!(result.len(), 10);
        for tuple in result.tuples()? {
            let foo = tuple.get_named("foo")?.as_int().expect("int");
            assert!(foo >= 40);
        }
        tx.commit()
    });
    fiber.wait().expect("scan failed");
}

#[test]
fn disjunctive_selection_unions_conjuncts() {
    let manager = manager();
    populate(&manager);

    let fiber = manager.start_transaction(TransactionType::Analytical, |mut tx, _| {
        let table = tx.open_table("scanned")?;
        // foo < 3 OR foo >= 48: 0,1,2,48,49.
        let query = ScanQuery::full(table)
            .or_where(Conjunct::new().and(FieldId(0), PredicateOp::Less, FieldValue::Int(3)))
            .or_where(Conjunct::new().and(
                FieldId(0),
                PredicateOp::GreaterEqual,
                FieldValue::Int(48),
            ));
        let result = tx.scan(&query, MEMORY)?;
        assert_eq!(result.len(), 5);
        tx.commit()
    });
    fiber.wait().expect("scan failed");
}

#[test]
fn projection_scan_narrows_the_schema() {
    let manager = manager();
    populate(&manager);

    let fiber = manager.start_transaction(TransactionType::Analytical, |mut tx, _| {
        let table = tx.open_table("scanned")?;
        let query = ScanQuery::projection(table, vec![FieldId(0)]);
        let result = tx.scan(&query, MEMORY)?;
        assert_eq!(result.len(), 50);
        assert_eq!(result.schema().field_count(), 1);
        let mut values: Vec<i32> = result
            .tuples()?
            .iter()
            .map(|t| t.get_named("foo").unwrap().as_int().unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, (0..50).collect::<Vec<_>>());
        tx.commit()
    });
    fiber.wait().expect("scan failed");
}

#[test]
fn aggregation_scan_folds_the_table() {
    let manager = manager();
    populate(&manager);

    let fiber = manager.start_transaction(TransactionType::Analytical, |mut tx, _| {
        let table = tx.open_table("scanned")?;
        let query = ScanQuery::aggregation(
            table,
            vec![
                (AggregationOp::Sum, FieldId(0)),
                (AggregationOp::Min, FieldId(0)),
                (AggregationOp::Max, FieldId(0)),
                (AggregationOp::Count, FieldId(0)),
            ],
        );
        let result = tx.scan(&query, MEMORY)?;
        assert_eq!(result.len(), 1);
        let tuple = &result.tuples()?[0];
        assert_eq!(tuple.get_named("sum_foo")?, &FieldValue::BigInt(1225));
        assert_eq!(tuple.get_named("min_foo")?, &FieldValue::Int(0));
        assert_eq!(tuple.get_named("max_foo")?, &FieldValue::Int(49));
        assert_eq!(tuple.get_named("cnt_foo")?, &FieldValue::BigInt(50));
        tx.commit()
    });
    fiber.wait().expect("scan failed");
}

#[test]
fn scans_require_analytical_mode() {
    let manager = manager();
    populate(&manager);

    let fiber = manager.start_transaction(TransactionType::ReadWrite, |mut tx, _| {
        let table = tx.open_table("scanned")?;
        let query = ScanQuery::full(table);
        match tx.scan(&query, MEMORY) {
            Err(TransactionError::NotAnalytical) => tx.commit(),
            other => panic!("expected NotAnalytical, got {other:?}"),
        }
    });
    fiber.wait().expect("fiber failed");
}

#[test]
fn mistyped_predicate_fails_before_dispatch() {
    let manager = manager();
    populate(&manager);

    let fiber = manager.start_transaction(TransactionType::Analytical, |mut tx, _| {
        let table = tx.open_table("scanned")?;
        let query = ScanQuery::full(table).or_where(Conjunct::new().and(
            FieldId(0),
            PredicateOp::Equal,
            FieldValue::Text("not an int".into()),
        ));
        match tx.scan(&query, MEMORY) {
            Err(TransactionError::WrongFieldType(name)) => {
                assert_eq!(name, "foo");
                tx.commit()
            }
            other => panic!("expected WrongFieldType, got {other:?}"),
        }
    });
    fiber.wait().expect("fiber failed");
}
