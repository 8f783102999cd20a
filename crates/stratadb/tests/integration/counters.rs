//! Counter uniqueness under concurrency.

use std::collections::HashSet;
use std::sync::Arc;

use stratadb::{ClientConfig, ClientManager, TransactionType};
use stratadb_store::{MemoryStore, RecordStore};

#[test]
fn two_counters_stay_disjoint_across_fibers() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let manager =
        ClientManager::new(Arc::clone(&store), ClientConfig { num_workers: 8 }).unwrap();

    let draws_per_fiber = 300usize;
    let mut fibers = Vec::new();
    for _ in 0..16 {
        fibers.push(
            manager.start_transaction(TransactionType::ReadWrite, move |tx, _| {
                let a = tx.get_counter("A");
                let b = tx.get_counter("B");
                for _ in 0..draws_per_fiber {
                    a.next()?;
                    b.next()?;
                }
                tx.commit()
            }),
        );
    }
    for fiber in fibers {
        fiber.wait().expect("fiber failed");
    }
}

#[test]
fn counter_values_are_unique_per_counter() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let manager = ClientManager::new(Arc::clone(&store), ClientConfig::default()).unwrap();

    // Draw through the context directly, from plain threads; the counter
    // is the same process-wide object transactions see.
    let counter_a = manager.context().counter("A");
    let counter_b = manager.context().counter("B");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let a = Arc::clone(&counter_a);
        let b = Arc::clone(&counter_b);
        handles.push(std::thread::spawn(move || {
            let mut drawn = Vec::with_capacity(400);
            for _ in 0..200 {
                drawn.push(("A", a.next().unwrap()));
                drawn.push(("B", b.next().unwrap()));
            }
            drawn
        }));
    }

    let mut seen_a = HashSet::new();
    let mut seen_b = HashSet::new();
    for handle in handles {
        for (name, id) in handle.join().unwrap() {
            let fresh = match name {
                "A" => seen_a.insert(id),
                _ => seen_b.insert(id),
            };
            assert!(fresh, "counter {name} repeated id {id}");
        }
    }
    assert_eq!(seen_a.len(), 16 * 200);
    assert_eq!(seen_b.len(), 16 * 200);
}

#[test]
fn ids_survive_a_client_restart() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let highest = {
        let manager = ClientManager::new(Arc::clone(&store), ClientConfig::default()).unwrap();
        let counter = manager.context().counter("restarting");
        let mut last = 0;
        for _ in 0..50 {
            last = counter.next().unwrap();
        }
        last
    };

    // A new manager over the same store: the first id skips everything
    // the burnt reservation covered.
    let manager = ClientManager::new(store, ClientConfig::default()).unwrap();
    let counter = manager.context().counter("restarting");
    assert!(counter.next().unwrap() > highest);
}
