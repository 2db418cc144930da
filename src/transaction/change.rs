// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Enumerates what a transaction changed, read straight from its undo log
// entries. Each `Change` names the map and key that were written and the
// value the write replaced, which is what a caller needs to replicate or
// audit the transaction.
//
// ============================================================================

use super::store::TransactionStore;
use super::versioned::{log_id_of, operation_id, transaction_id_of};
use crate::core::{Result, Value};
use std::sync::Arc;

/// One write of a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Map that was written
    pub map_name: String,
    pub key: Value,
    /// Value before the write, `None` if the key was absent or deleted
    pub value: Option<Value>,
}

/// Lazily walks a transaction's undo log backwards from `from_log_id - 1` down to `to_log_id`
pub struct ChangeIter {
    store: Arc<TransactionStore>,
    transaction_id: u32,
    log_id: u64,
    to_log_id: u64,
}

impl ChangeIter {
    pub(crate) fn new(store: Arc<TransactionStore>, transaction_id: u32, from_log_id: u64, to_log_id: u64) -> Self {
        Self { store, transaction_id, log_id: from_log_id, to_log_id }
    }

    fn next_change(&mut self) -> Result<Option<Change>> {
        let undo_log = self.store.undo_log();
        while self.log_id > self.to_log_id {
            self.log_id -= 1;
            let operation = operation_id(self.transaction_id, self.log_id);
            let Some(record) = undo_log.get(&operation)? else {
                // jump over the gap to the next older entry of this transaction
                self.log_id = match undo_log.floor_key(&operation)? {
                    Some(older) if transaction_id_of(older) == self.transaction_id => {
                        (log_id_of(older) + 1).max(self.to_log_id)
                    }
                    _ => self.to_log_id,
                };
                continue;
            };

            let (map_id, key, old_value) = record.into_parts();
            let Some(map_name) = self.store.mv_store().map_name(map_id)? else {
                continue;
            };
            return Ok(Some(Change {
                map_name,
                key,
                value: old_value.and_then(|v| v.into_value()),
            }));
        }
        Ok(None)
    }
}

impl Iterator for ChangeIter {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_change().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;
    use crate::storage::MvStore;

    #[test]
    fn test_changes_are_listed_newest_first_with_replaced_values() {
        let store = TransactionStore::new(Arc::new(MvStore::in_memory())).unwrap();
        store.init().unwrap();

        let setup = store.begin().unwrap();
        setup.open_map("users").unwrap().put(Value::from(1), Value::from("ann")).unwrap();
        setup.commit().unwrap();

        let tx = store.begin().unwrap();
        let users = tx.open_map("users").unwrap();
        let audit = tx.open_map("audit").unwrap();
        users.put(Value::from(1), Value::from("anna")).unwrap();
        let savepoint = tx.set_savepoint();
        audit.put(Value::from(10), Value::from("renamed")).unwrap();
        users.remove(&Value::from(1)).unwrap();

        let changes = tx.get_changes(0).unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(
            changes,
            vec![
                Change { map_name: "users".into(), key: Value::from(1), value: Some(Value::from("anna")) },
                Change { map_name: "audit".into(), key: Value::from(10), value: None },
                Change { map_name: "users".into(), key: Value::from(1), value: Some(Value::from("ann")) },
            ]
        );

        let since_savepoint = tx.get_changes(savepoint).unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(since_savepoint.len(), 2);
        assert_eq!(since_savepoint[1].map_name, "audit");
        tx.rollback().unwrap();
    }

    #[test]
    fn test_no_changes() {
        let store = TransactionStore::new(Arc::new(MvStore::in_memory())).unwrap();
        store.init().unwrap();
        let tx = store.begin().unwrap();
        assert_eq!(tx.get_changes(0).unwrap().count(), 0);
        tx.commit().unwrap();
    }

    #[test]
    fn test_changes_of_closed_transaction() {
        let store = TransactionStore::new(Arc::new(MvStore::in_memory())).unwrap();
        store.init().unwrap();
        let tx = store.begin().unwrap();
        tx.open_map("data").unwrap().put(Value::from(1), Value::from(1)).unwrap();
        tx.commit().unwrap();
        assert!(matches!(tx.get_changes(0), Err(DbError::TransactionClosed(_))));
    }
}
