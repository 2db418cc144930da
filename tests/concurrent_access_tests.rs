/// Concurrent access tests
///
/// Many transactions driven from different threads against one store
/// Run with: cargo test --test concurrent_access_tests

use memtx::{DbError, MvStore, Result, TransactionStore, Value};
use std::sync::Arc;
use tokio::sync::Barrier;

fn new_store() -> Arc<TransactionStore> {
    let store = TransactionStore::new(Arc::new(MvStore::in_memory())).unwrap();
    store.init().unwrap();
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_disjoint_keys() {
    let store = new_store();
    let num_tasks = 8;
    let writes_per_task = 50;
    let barrier = Arc::new(Barrier::new(num_tasks));

    let mut handles = vec![];
    for task_id in 0..num_tasks {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            tokio::task::spawn_blocking(move || {
                let tx = store.begin().unwrap();
                let map = tx.open_map("data").unwrap();
                for i in 0..writes_per_task {
                    let id = (task_id * 1000 + i) as i64;
                    map.put(Value::from(id), Value::from(task_id as i64)).unwrap();
                }
                tx.commit().unwrap();
            })
            .await
            .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let reader = store.begin().unwrap();
    let map = reader.open_map("data").unwrap();
    assert_eq!(map.size_as_long().unwrap(), (num_tasks * writes_per_task) as u64);
    assert!(store.is_undo_empty().unwrap());
    assert!(store.committing_transactions().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_writers_exactly_one_wins() {
    let store = new_store();
    let num_tasks = 6;

    for round in 0..20i64 {
        let start = Arc::new(Barrier::new(num_tasks));
        let attempted = Arc::new(Barrier::new(num_tasks));
        let mut handles = vec![];
        for task_id in 0..num_tasks {
            let store = Arc::clone(&store);
            let start = Arc::clone(&start);
            let attempted = Arc::clone(&attempted);
            handles.push(tokio::spawn(async move {
                let tx = store.begin().unwrap();
                let map = tx.open_map("contended").unwrap();
                start.wait().await;
                let won = map
                    .try_put(Value::from(round), Value::from(task_id as i64))
                    .unwrap();
                // nobody finishes before every task has tried
                attempted.wait().await;
                if won {
                    assert_eq!(tx.log_id(), 1);
                    tx.commit().unwrap();
                } else {
                    // the loser's undo entry was reverted
                    assert_eq!(tx.log_id(), 0);
                    tx.rollback().unwrap();
                }
                won
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "round {} had {} winners", round, winners);
    }

    assert!(store.is_undo_empty().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_see_consistent_snapshots_during_transfers() {
    let store = new_store();
    let accounts = 10i64;
    let initial = 100i64;
    {
        let setup = store.begin().unwrap();
        let map = setup.open_map("accounts").unwrap();
        for id in 0..accounts {
            map.put(Value::from(id), Value::from(initial)).unwrap();
        }
        setup.commit().unwrap();
    }

    let writer_store = Arc::clone(&store);
    let writer = tokio::task::spawn_blocking(move || {
        let mut committed = 0;
        for i in 0..200i64 {
            let from = i % accounts;
            let to = (i * 7 + 3) % accounts;
            if from == to {
                continue;
            }
            let tx = writer_store.begin().unwrap();
            let map = tx.open_map("accounts").unwrap();
            let from_balance = map.get(&Value::from(from)).unwrap().and_then(|v| v.as_i64()).unwrap();
            let to_balance = map.get(&Value::from(to)).unwrap().and_then(|v| v.as_i64()).unwrap();
            map.put(Value::from(from), Value::from(from_balance - 1)).unwrap();
            map.put(Value::from(to), Value::from(to_balance + 1)).unwrap();
            tx.commit().unwrap();
            committed += 1;
        }
        committed
    });

    let mut readers = vec![];
    for _ in 0..3 {
        let store = Arc::clone(&store);
        readers.push(tokio::task::spawn_blocking(move || {
            for _ in 0..100 {
                let tx = store.begin().unwrap();
                let map = tx.open_map("accounts").unwrap();
                let total: i64 = map
                    .entry_iterator(None, None)
                    .unwrap()
                    .map(|entry| entry.map(|(_, v)| v.as_i64().unwrap_or(0)))
                    .sum::<Result<i64>>()
                    .unwrap();
                assert_eq!(total, accounts * initial);
                assert_eq!(map.size_as_long().unwrap(), accounts as u64);
                tx.commit().unwrap();
            }
        }));
    }

    for reader in readers {
        reader.await.unwrap();
    }
    assert!(writer.await.unwrap() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_after_entry_locked() {
    let store = new_store();
    let holder = store.begin().unwrap();
    holder.open_map("data").unwrap().put(Value::from("k"), Value::from(1)).unwrap();

    let retry_store = Arc::clone(&store);
    let retrier = tokio::task::spawn_blocking(move || {
        let tx = retry_store.begin().unwrap();
        let map = tx.open_map("data").unwrap();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match map.put(Value::from("k"), Value::from(2)) {
                Ok(_) => break,
                Err(e @ DbError::EntryLocked { .. }) => {
                    assert!(e.is_retryable());
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        tx.commit().unwrap();
        attempts
    });

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    holder.commit().unwrap();

    assert!(retrier.await.unwrap() >= 1);
    let reader = store.begin().unwrap();
    assert_eq!(
        reader.open_map("data").unwrap().get(&Value::from("k")).unwrap(),
        Some(Value::from(2))
    );
}
