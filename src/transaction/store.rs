// ============================================================================
// Transaction Store
// ============================================================================
//
// Coordinates transactions over one `MvStore`:
// - allocates and recycles transaction-id slots
// - owns the shared undo log and the persisted records of prepared,
//   named and committing transactions
// - publishes the committing-transactions set readers consult for visibility
// - applies commits and rollbacks against the base maps
// - rebuilds in-flight transactions from the undo log after a restart
//
// ============================================================================

use super::bitset::BitSet;
use super::change::ChangeIter;
use super::snapshot::TxSnapshot;
use super::state::{PackedState, TransactionStatus};
use super::txn::Transaction;
use super::undo::{UNDO_LOG_NAME, UndoLog, UndoRecord};
use super::versioned::{LOG_ID_MASK, VersionedValue, log_id_of, operation_id, transaction_id_of};
use crate::core::{DbError, Result, Value};
use crate::storage::store::TEMP_MAP_PREFIX;
use crate::storage::{Decision, MvMap, MvStore, stable_sample};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Name of the map holding records of transactions that must survive a restart
pub const TRANSACTION_RECORDS_NAME: &str = "openTransactions";

/// What is persisted about a prepared, named or committing transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    status: u8,
    name: Option<String>,
    log_id: u64,
}

impl TransactionRecord {
    pub fn new(status: TransactionStatus, name: Option<String>, log_id: u64) -> Self {
        Self { status: status as u8, name, log_id }
    }

    pub fn status(&self) -> Result<TransactionStatus> {
        TransactionStatus::from_u8(self.status)
            .ok_or_else(|| DbError::Corruption(format!("Unknown transaction status {}", self.status)))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }
}

struct OpenSlots {
    open: BitSet,
    next_sequence: u64,
}

pub struct TransactionStore {
    store: Arc<MvStore>,
    undo_log: Arc<UndoLog>,
    records: Arc<MvMap<u32, TransactionRecord>>,
    transactions: RwLock<HashMap<u32, Arc<Transaction>>>,
    slots: Mutex<OpenSlots>,
    committing: RwLock<Arc<BitSet>>,
    max_transaction_id: u32,
    initialized: AtomicBool,
}

impl TransactionStore {
    /// Attach to a store; call [`TransactionStore::init`] before beginning transactions
    pub fn new(store: Arc<MvStore>) -> Result<Arc<Self>> {
        let undo_log = store.open_map::<u64, UndoRecord>(UNDO_LOG_NAME)?;
        let records = store.open_map::<u32, TransactionRecord>(TRANSACTION_RECORDS_NAME)?;
        let max_transaction_id = store.config().max_transaction_id;
        Ok(Arc::new(Self {
            store,
            undo_log,
            records,
            transactions: RwLock::new(HashMap::new()),
            slots: Mutex::new(OpenSlots { open: BitSet::new(), next_sequence: 1 }),
            committing: RwLock::new(Arc::new(BitSet::new())),
            max_transaction_id,
            initialized: AtomicBool::new(false),
        }))
    }

    pub fn mv_store(&self) -> &Arc<MvStore> {
        &self.store
    }

    pub fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    pub fn is_auto_commit(&self) -> bool {
        let config = self.store.config();
        config.auto_commit && !config.read_only
    }

    pub(crate) fn undo_log(&self) -> &Arc<UndoLog> {
        &self.undo_log
    }

    pub fn max_transaction_id(&self) -> u32 {
        self.max_transaction_id
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Drop leftover temp maps and rebuild every transaction that was in flight
    /// when the store was last persisted.
    ///
    /// Transactions persisted as COMMITTING are committed right away; the rest
    /// come back with their persisted status (OPEN when nothing was recorded)
    /// and are listed by [`TransactionStore::open_transactions`].
    pub fn init(self: &Arc<Self>) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let removed = self.store.remove_temp_maps()?;
        if removed > 0 {
            debug!("Removed {} leftover temp maps", removed);
        }

        let mut recovered = Vec::new();
        let mut next = self.undo_log.first_key()?;
        while let Some(first) = next {
            let transaction_id = transaction_id_of(first);
            let last_in_range = operation_id(transaction_id, LOG_ID_MASK);
            let last = self.undo_log.floor_key(&last_in_range)?.unwrap_or(first);
            let log_id = log_id_of(last) + 1;

            let record = self.records.get(&transaction_id)?;
            let was_stored = record.is_some();
            let (status, name) = match record {
                Some(record) => (record.status()?, record.name),
                None => (TransactionStatus::Open, None),
            };
            recovered.push(self.register(transaction_id, status, name, log_id, was_stored)?);
            next = self.undo_log.higher_key(&last_in_range)?;
        }

        for (transaction_id, record) in self.records.cursor(None)? {
            if self.transactions.read()?.contains_key(&transaction_id) {
                continue;
            }
            let status = record.status()?;
            recovered.push(self.register(transaction_id, status, record.name, 0, true)?);
        }

        for transaction in recovered {
            info!("Recovered transaction {}", transaction);
            if transaction.status() == TransactionStatus::Committing {
                transaction.commit()?;
                info!("Finished interrupted commit of transaction {}", transaction.id());
            }
        }
        Ok(())
    }

    fn register(
        self: &Arc<Self>,
        transaction_id: u32,
        status: TransactionStatus,
        name: Option<String>,
        log_id: u64,
        was_stored: bool,
    ) -> Result<Arc<Transaction>> {
        let mut slots = self.slots.lock()?;
        let sequence_num = slots.next_sequence;
        slots.next_sequence += 1;
        slots.open.insert(transaction_id);

        let state = PackedState::compose(status, log_id, false);
        let transaction = Arc::new(Transaction::new(
            Arc::clone(self),
            transaction_id,
            sequence_num,
            state,
            name,
            was_stored,
        ));
        self.transactions
            .write()?
            .insert(transaction_id, Arc::clone(&transaction));
        Ok(transaction)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(self: &Arc<Self>) -> Result<Arc<Transaction>> {
        self.begin_with(None)
    }

    pub fn begin_named(self: &Arc<Self>, name: impl Into<String>) -> Result<Arc<Transaction>> {
        let transaction = self.begin_with(Some(name.into()))?;
        self.store_transaction(&transaction)?;
        Ok(transaction)
    }

    fn begin_with(self: &Arc<Self>, name: Option<String>) -> Result<Arc<Transaction>> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(DbError::InvalidArgument("Transaction store is not initialized".into()));
        }
        if self.store.is_closed() {
            return Err(DbError::StoreClosed);
        }

        let transaction = {
            let mut slots = self.slots.lock()?;
            let transaction_id = slots.open.next_clear_bit(1);
            if transaction_id > self.max_transaction_id {
                return Err(DbError::TooManyOpenTransactions(self.max_transaction_id));
            }
            let sequence_num = slots.next_sequence;
            slots.next_sequence += 1;
            slots.open.insert(transaction_id);

            let closed = PackedState::compose(TransactionStatus::Closed, 0, false);
            let transaction = Arc::new(Transaction::new(
                Arc::clone(self),
                transaction_id,
                sequence_num,
                closed,
                name,
                false,
            ));
            self.transactions
                .write()?
                .insert(transaction_id, Arc::clone(&transaction));
            transaction
        };
        transaction.transition(TransactionStatus::Open)?;
        debug!("Began transaction {}", transaction);
        Ok(transaction)
    }

    /// Transactions that are currently open, prepared or committing, by id
    pub fn open_transactions(&self) -> Result<Vec<Arc<Transaction>>> {
        let mut open: Vec<Arc<Transaction>> = self.transactions.read()?.values().cloned().collect();
        open.sort_by_key(|transaction| transaction.id());
        Ok(open)
    }

    /// Ids of transactions currently finishing their commit
    pub fn committing_transactions(&self) -> Result<Arc<BitSet>> {
        Ok(Arc::clone(&*self.committing.read()?))
    }

    pub fn is_undo_empty(&self) -> Result<bool> {
        self.undo_log.is_empty()
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Open (or create) a transactional base map.
    ///
    /// Names starting with `temp.` are reserved for scratch maps, which `init` drops.
    pub fn open_map(&self, name: &str) -> Result<Arc<MvMap<Value, VersionedValue>>> {
        if name.starts_with(TEMP_MAP_PREFIX) {
            return Err(DbError::InvalidArgument(format!(
                "Map name '{}' uses the reserved prefix '{}'",
                name, TEMP_MAP_PREFIX
            )));
        }
        self.store.open_map::<Value, VersionedValue>(name)
    }

    pub fn has_map(&self, name: &str) -> Result<bool> {
        self.store.has_map(name)
    }

    pub fn remove_map(&self, name: &str) -> Result<()> {
        if name == UNDO_LOG_NAME || name == TRANSACTION_RECORDS_NAME {
            return Err(DbError::InvalidArgument(format!("Map '{}' is reserved", name)));
        }
        self.store.remove_map(name)
    }

    fn map_by_id(&self, map_id: u32) -> Result<Option<Arc<MvMap<Value, VersionedValue>>>> {
        match self.store.map_name(map_id)? {
            Some(name) => Ok(Some(self.open_map(&name)?)),
            None => Ok(None),
        }
    }

    /// Scratch map for one operation; never persisted
    pub fn create_temp_map(&self) -> Result<Arc<MvMap<Value, ()>>> {
        self.store.create_temp_map::<Value, ()>()
    }

    pub fn remove_temp_map(&self, map: &MvMap<Value, ()>) -> Result<()> {
        self.store.remove_map(map.name())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Consistent (map root, undo root, committing set) for `map`.
    ///
    /// Holding the committing read lock keeps commits from flipping their bit
    /// while the roots are sampled.
    pub(crate) fn snapshot(&self, map: &MvMap<Value, VersionedValue>) -> Result<TxSnapshot> {
        let committing = self.committing.read()?;
        stable_sample(|| {
            Ok(TxSnapshot {
                map_root: map.get_root()?,
                undo_root: self.undo_log.get_root()?,
                committing: Arc::clone(&*committing),
            })
        })
    }

    fn flip_committing(&self, transaction_id: u32, committing: bool) -> Result<()> {
        let mut set = self.committing.write()?;
        let next = if committing {
            set.with(transaction_id)
        } else {
            set.without(transaction_id)
        };
        *set = Arc::new(next);
        Ok(())
    }

    // ========================================================================
    // Commit / Rollback
    // ========================================================================

    /// Persist the record of a transaction that must survive a restart
    pub(crate) fn store_transaction(&self, transaction: &Transaction) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let state = transaction.packed_state();
        let status = state.status();
        let name = transaction.name()?;
        if matches!(status, TransactionStatus::Prepared | TransactionStatus::Committing) || name.is_some() {
            let record = TransactionRecord::new(status, name, state.log_id());
            self.records.put(transaction.id(), record)?;
            transaction.mark_stored();
        }
        Ok(())
    }

    /// Turn every write of a COMMITTING transaction into a committed value
    pub(crate) fn commit(&self, transaction: &Transaction, max_log_id: u64) -> Result<()> {
        if self.store.is_closed() {
            return Err(DbError::StoreClosed);
        }
        let transaction_id = transaction.id();
        self.store_transaction(transaction)?;

        // from here on every reader sees this transaction's writes as committed
        self.flip_committing(transaction_id, true)?;
        let applied = self.apply_commit(transaction, max_log_id);
        let cleared = self.flip_committing(transaction_id, false);
        applied.and(cleared)
    }

    fn apply_commit(&self, transaction: &Transaction, max_log_id: u64) -> Result<()> {
        transaction.transition(TransactionStatus::Committed)?;
        let transaction_id = transaction.id();
        let first = operation_id(transaction_id, 0);
        let last = operation_id(transaction_id, max_log_id - 1);

        let mut applied = 0usize;
        let undo_root = self.undo_log.get_root()?;
        for (operation, record) in undo_root.range_cursor(Some(&first), Some(&last)) {
            let (map_id, key, _) = record.into_parts();
            if let Some(map) = self.map_by_id(map_id)? {
                map.operate(&key, |current| match current {
                    Some(raw) if raw.operation_id() == operation => match raw.value() {
                        Some(value) => Decision::Put(VersionedValue::committed(Some(value.clone()))),
                        None => Decision::Remove,
                    },
                    _ => Decision::Abort,
                })?;
            }
            self.undo_log.remove(&operation)?;
            applied += 1;
        }
        debug!("Transaction {} committed {} undo entries", transaction_id, applied);
        Ok(())
    }

    /// Restore the values overwritten by log entries `[to_log_id, max_log_id)`, newest first
    pub(crate) fn rollback_to(&self, transaction: &Transaction, max_log_id: u64, to_log_id: u64) -> Result<()> {
        let transaction_id = transaction.id();
        for log_id in (to_log_id..max_log_id).rev() {
            let operation = operation_id(transaction_id, log_id);
            let Some(record) = self.undo_log.get(&operation)? else {
                continue;
            };
            let (map_id, key, old_value) = record.into_parts();
            // older writes of this transaction inside the range are restored by their own entry
            let restore = match &old_value {
                None => true,
                Some(old) => {
                    old.is_committed()
                        || (old.writer() == Some(transaction_id) && log_id_of(old.operation_id()) < to_log_id)
                }
            };
            if restore && let Some(map) = self.map_by_id(map_id)? {
                match old_value {
                    Some(old) => {
                        map.put(key, old)?;
                    }
                    None => {
                        map.remove(&key)?;
                    }
                }
            }
            self.undo_log.remove(&operation)?;
        }
        Ok(())
    }

    /// Close the transaction and release its slot
    pub(crate) fn end_transaction(&self, transaction: &Transaction, has_changes: bool) -> Result<()> {
        transaction.transition(TransactionStatus::Closed)?;
        transaction.mark_statement_end()?;

        let transaction_id = transaction.id();
        self.transactions.write()?.remove(&transaction_id);
        let was_stored = transaction.was_stored();
        if was_stored {
            self.records.remove(&transaction_id)?;
        }
        self.slots.lock()?.open.remove(transaction_id);

        if (has_changes || was_stored) && self.is_auto_commit() && !self.store.is_closed() {
            self.store.commit()?;
        }
        Ok(())
    }

    /// Changes in `[to_log_id, from_log_id)`, newest first
    pub fn get_changes(
        self: &Arc<Self>,
        transaction: &Transaction,
        from_log_id: u64,
        to_log_id: u64,
    ) -> Result<ChangeIter> {
        transaction.check_not_closed()?;
        Ok(ChangeIter::new(Arc::clone(self), transaction.id(), from_log_id, to_log_id))
    }

    /// Forget all transactions and persist the store
    pub fn close(&self) -> Result<()> {
        let dropped: Vec<Arc<Transaction>> = self.transactions.write()?.drain().map(|(_, t)| t).collect();
        if !dropped.is_empty() {
            warn!("Closing transaction store with {} transactions in flight", dropped.len());
        }
        if !self.store.is_closed() && !self.store.is_read_only() {
            self.store.commit()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("max_transaction_id", &self.max_transaction_id)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}
