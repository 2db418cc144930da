//! Integration tests for snapshot persistence and transaction recovery

use memtx::transaction::{TRANSACTION_RECORDS_NAME, TransactionRecord};
use memtx::{DbError, MvStore, StoreConfig, TransactionStatus, TransactionStore, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn open(config: &StoreConfig) -> Arc<TransactionStore> {
    let mv_store = Arc::new(MvStore::open(config.clone()).unwrap());
    let store = TransactionStore::new(mv_store).unwrap();
    store.init().unwrap();
    store
}

fn file_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new().path(dir.path().join("memtx.db"))
}

#[test]
fn test_committed_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);
    {
        let store = open(&config);
        let tx = store.begin().unwrap();
        let map = tx.open_map("users").unwrap();
        map.put(Value::from(1), Value::from("alice")).unwrap();
        map.put(Value::from(2), Value::from("bob")).unwrap();
        tx.commit().unwrap();
        store.close().unwrap();
    }

    let store = open(&config);
    assert!(store.open_transactions().unwrap().is_empty());
    let tx = store.begin().unwrap();
    let map = tx.open_map("users").unwrap();
    assert_eq!(map.get(&Value::from(1)).unwrap(), Some(Value::from("alice")));
    assert_eq!(map.size_as_long().unwrap(), 2);
}

#[test]
fn test_commit_persists_without_close() {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);
    {
        let store = open(&config);
        let tx = store.begin().unwrap();
        tx.open_map("data").unwrap().put(Value::from("k"), Value::from(42)).unwrap();
        tx.commit().unwrap();
        // dropped without close, as after a crash
    }

    let store = open(&config);
    let tx = store.begin().unwrap();
    assert_eq!(
        tx.open_map("data").unwrap().get(&Value::from("k")).unwrap(),
        Some(Value::from(42))
    );
}

#[test]
fn test_prepared_transaction_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);
    {
        let store = open(&config);
        let tx = store.begin_named("xa-1").unwrap();
        tx.open_map("orders").unwrap().put(Value::from(7), Value::from("pending")).unwrap();
        tx.prepare().unwrap();
    }

    let store = open(&config);
    let open_transactions = store.open_transactions().unwrap();
    assert_eq!(open_transactions.len(), 1);
    let recovered = &open_transactions[0];
    assert_eq!(recovered.status(), TransactionStatus::Prepared);
    assert_eq!(recovered.name().unwrap().as_deref(), Some("xa-1"));
    assert_eq!(recovered.log_id(), 1);

    let other = store.begin().unwrap();
    let orders = other.open_map("orders").unwrap();
    assert_eq!(orders.get(&Value::from(7)).unwrap(), None);
    assert!(matches!(
        orders.put(Value::from(7), Value::from("other")),
        Err(DbError::EntryLocked { .. })
    ));

    recovered.commit().unwrap();
    assert_eq!(orders.get(&Value::from(7)).unwrap(), Some(Value::from("pending")));
    other.rollback().unwrap();
    drop(store);

    let store = open(&config);
    assert!(store.open_transactions().unwrap().is_empty());
    assert!(store.is_undo_empty().unwrap());
}

#[test]
fn test_open_transaction_is_recovered_and_can_roll_back() {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);
    {
        let store = open(&config);
        let setup = store.begin().unwrap();
        setup.open_map("data").unwrap().put(Value::from(1), Value::from("one")).unwrap();
        setup.commit().unwrap();

        let unfinished = store.begin().unwrap();
        let map = unfinished.open_map("data").unwrap();
        map.put(Value::from(1), Value::from("uno")).unwrap();
        map.put(Value::from(2), Value::from("dos")).unwrap();
        store.close().unwrap();
    }

    let store = open(&config);
    let open_transactions = store.open_transactions().unwrap();
    assert_eq!(open_transactions.len(), 1);
    assert_eq!(open_transactions[0].status(), TransactionStatus::Open);
    assert_eq!(open_transactions[0].log_id(), 2);

    let reader = store.begin().unwrap();
    let data = reader.open_map("data").unwrap();
    assert_eq!(data.get(&Value::from(1)).unwrap(), Some(Value::from("one")));
    assert_eq!(data.size_as_long().unwrap(), 1);

    open_transactions[0].rollback().unwrap();
    assert!(store.is_undo_empty().unwrap());
    assert_eq!(data.get(&Value::from(1)).unwrap(), Some(Value::from("one")));
    assert_eq!(data.get(&Value::from(2)).unwrap(), None);
}

#[test]
fn test_interrupted_commit_is_finished_on_init() {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);
    {
        let mv_store = Arc::new(MvStore::open(config.clone()).unwrap());
        let store = TransactionStore::new(Arc::clone(&mv_store)).unwrap();
        store.init().unwrap();

        let tx = store.begin().unwrap();
        let map = tx.open_map("data").unwrap();
        map.put(Value::from("a"), Value::from(1)).unwrap();
        map.remove(&Value::from("a")).unwrap();
        map.put(Value::from("b"), Value::from(2)).unwrap();

        // the state a crash between the COMMITTING record and compaction leaves behind
        let records = mv_store
            .open_map::<u32, TransactionRecord>(TRANSACTION_RECORDS_NAME)
            .unwrap();
        records
            .put(tx.id(), TransactionRecord::new(TransactionStatus::Committing, None, tx.log_id()))
            .unwrap();
        mv_store.commit().unwrap();
    }

    let store = open(&config);
    assert!(store.open_transactions().unwrap().is_empty());
    assert!(store.is_undo_empty().unwrap());

    let reader = store.begin().unwrap();
    let data = reader.open_map("data").unwrap();
    assert_eq!(data.get(&Value::from("a")).unwrap(), None);
    assert_eq!(data.get(&Value::from("b")).unwrap(), Some(Value::from(2)));
    assert_eq!(data.size_as_long().unwrap(), 1);
    assert_eq!(data.base_map().size().unwrap(), 1);
}

#[test]
fn test_temp_maps_are_dropped_by_init() {
    let mv_store = Arc::new(MvStore::in_memory());
    let first = TransactionStore::new(Arc::clone(&mv_store)).unwrap();
    first.init().unwrap();
    let scratch = first.create_temp_map().unwrap();
    scratch.put(Value::from(1), ()).unwrap();
    assert!(mv_store.has_map(scratch.name()).unwrap());

    let second = TransactionStore::new(Arc::clone(&mv_store)).unwrap();
    second.init().unwrap();
    assert!(!mv_store.has_map(scratch.name()).unwrap());
}

#[test]
fn test_read_only_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = file_config(&temp_dir);
    {
        let store = open(&config);
        let tx = store.begin().unwrap();
        tx.open_map("data").unwrap().put(Value::from(1), Value::from(1)).unwrap();
        tx.commit().unwrap();

        let unfinished = store.begin().unwrap();
        unfinished.open_map("data").unwrap().put(Value::from(1), Value::from(2)).unwrap();
        store.close().unwrap();
    }

    let store = open(&config.clone().read_only(true));
    let tx = store.begin().unwrap();
    let map = tx.open_map("data").unwrap();
    assert_eq!(map.get(&Value::from(1)).unwrap(), Some(Value::from(1)));
    assert!(matches!(
        map.put(Value::from(3), Value::from(3)),
        Err(DbError::ReadOnly)
    ));
}
