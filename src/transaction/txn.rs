// ============================================================================
// Transaction
// ============================================================================
//
// A unit of work against a `TransactionStore`. All mutable state that other
// threads may observe lives in the packed `TransactionState` word; the rest
// (name, statement counter) is only touched by the thread driving the
// transaction. One thread drives a transaction's mutating calls at a time.
//
// ============================================================================

use super::change::ChangeIter;
use super::map::TransactionMap;
use super::state::{PackedState, TransactionState, TransactionStatus, check_open};
use super::store::TransactionStore;
use super::undo::UndoRecord;
use super::versioned::{VersionedValue, operation_id};
use crate::core::{DbError, Result, Value};
use crate::storage::{MvMap, TxCounter};
use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Level, event, info_span};

pub struct Transaction {
    store: Arc<TransactionStore>,
    transaction_id: u32,
    sequence_num: u64,
    state: TransactionState,
    name: Mutex<Option<String>>,
    tx_counter: Mutex<Option<TxCounter>>,
    was_stored: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(
        store: Arc<TransactionStore>,
        transaction_id: u32,
        sequence_num: u64,
        state: PackedState,
        name: Option<String>,
        was_stored: bool,
    ) -> Self {
        Self {
            store,
            transaction_id,
            sequence_num,
            state: TransactionState::new(state),
            name: Mutex::new(name),
            tx_counter: Mutex::new(None),
            was_stored: AtomicBool::new(was_stored),
        }
    }

    /// Slot id; reused once this transaction is closed
    pub fn id(&self) -> u32 {
        self.transaction_id
    }

    /// Never reused
    pub fn sequence_num(&self) -> u64 {
        self.sequence_num
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.load().status()
    }

    pub fn log_id(&self) -> u64 {
        self.state.load().log_id()
    }

    pub fn has_changes(&self) -> bool {
        self.state.load().has_changes()
    }

    pub fn has_rollback(&self) -> bool {
        self.state.load().has_rollback()
    }

    pub fn is_open(&self) -> bool {
        self.status().is_open()
    }

    pub fn name(&self) -> Result<Option<String>> {
        Ok(self.name.lock()?.clone())
    }

    /// Name the transaction; named transactions are persisted for recovery
    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        self.check_not_closed()?;
        *self.name.lock()? = Some(name.into());
        self.store.store_transaction(self)
    }

    pub(crate) fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    pub(crate) fn packed_state(&self) -> PackedState {
        self.state.load()
    }

    pub(crate) fn transition(&self, to: TransactionStatus) -> Result<PackedState> {
        self.state.transition(self.transaction_id, to)
    }

    pub(crate) fn was_stored(&self) -> bool {
        self.was_stored.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stored(&self) {
        self.was_stored.store(true, Ordering::Release);
    }

    pub(crate) fn check_not_closed(&self) -> Result<()> {
        if self.status().is_closed() {
            return Err(DbError::TransactionClosed(self.transaction_id));
        }
        Ok(())
    }

    // ========================================================================
    // Undo Log
    // ========================================================================

    /// Current log id; rolling back to it later discards everything written after this call
    pub fn set_savepoint(&self) -> u64 {
        self.log_id()
    }

    /// Reserve a log slot and record what the upcoming write will overwrite.
    ///
    /// Returns the operation id the new value must be tagged with.
    pub(crate) fn log(&self, map_id: u32, key: Value, old_value: Option<VersionedValue>) -> Result<u64> {
        if self.store.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        let before = self.state.increment_log(self.transaction_id)?;
        let operation = operation_id(self.transaction_id, before.log_id());
        self.store
            .undo_log()
            .put(operation, UndoRecord::new(map_id, key, old_value))?;
        Ok(operation)
    }

    /// Drop the most recent undo entry after its write lost a race
    pub(crate) fn log_undo(&self) -> Result<()> {
        let after = self.state.decrement_log(self.transaction_id)?;
        let operation = operation_id(self.transaction_id, after.log_id());
        if self.store.undo_log().remove(&operation)?.is_none() {
            return Err(DbError::Corruption(format!(
                "Transaction {} has no undo entry at log id {}",
                self.transaction_id,
                after.log_id()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Transactional view of the named map, created if missing
    pub fn open_map(self: &Arc<Self>, name: &str) -> Result<TransactionMap> {
        self.check_not_closed()?;
        let map = self.store.open_map(name)?;
        Ok(TransactionMap::new(Arc::clone(self), map))
    }

    /// Transactional view of an already opened base map
    pub fn open_map_with(self: &Arc<Self>, map: Arc<MvMap<Value, VersionedValue>>) -> Result<TransactionMap> {
        self.check_not_closed()?;
        Ok(TransactionMap::new(Arc::clone(self), map))
    }

    pub fn remove_map(&self, map: &TransactionMap) -> Result<()> {
        self.check_not_closed()?;
        self.store.remove_map(map.name())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Pin the current store version until `mark_statement_end`
    pub fn mark_statement_start(&self) -> Result<()> {
        self.mark_statement_end()?;
        let counter = self.store.mv_store().register_version_usage()?;
        *self.tx_counter.lock()? = Some(counter);
        Ok(())
    }

    pub fn mark_statement_end(&self) -> Result<()> {
        let counter = self.tx_counter.lock()?.take();
        if let Some(counter) = counter {
            self.store.mv_store().deregister_version_usage(counter)?;
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// First phase of two-phase commit; the transaction survives a restart as PREPARED
    pub fn prepare(&self) -> Result<()> {
        self.transition(TransactionStatus::Prepared)?;
        self.store.store_transaction(self)?;
        if self.store.is_auto_commit() {
            self.store.mv_store().commit()?;
        }
        debug!("Transaction {} prepared", self);
        Ok(())
    }

    /// Make every change visible to other transactions and close
    pub fn commit(&self) -> Result<()> {
        let span = info_span!(
            "transaction.commit",
            transaction_id = self.transaction_id,
            sequence_num = self.sequence_num
        );
        let _enter = span.enter();

        self.mark_statement_end()?;
        let before = self.transition(TransactionStatus::Committing)?;
        let has_changes = before.has_changes();
        event!(Level::DEBUG, log_id = before.log_id(), "committing");

        let committed = if has_changes {
            self.store.commit(self, before.log_id())
        } else {
            Ok(())
        };
        let ended = self.store.end_transaction(self, has_changes);
        match (committed, ended) {
            (Err(e), Err(end_error)) => {
                warn!("Transaction {} could not be ended after a failed commit: {}", self, end_error);
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Undo every change made after `savepoint` and keep the transaction open
    pub fn rollback_to_savepoint(&self, savepoint: u64) -> Result<()> {
        let span = info_span!(
            "transaction.rollback_to_savepoint",
            transaction_id = self.transaction_id,
            savepoint
        );
        let _enter = span.enter();

        let current = self.state.load();
        check_open(self.transaction_id, current.status())?;
        if savepoint > current.log_id() {
            return Err(DbError::InvalidArgument(format!(
                "Savepoint {} is past the current log id {}",
                savepoint,
                current.log_id()
            )));
        }

        let last = self.transition(TransactionStatus::RollingBack)?;
        let log_id = last.log_id();
        let rolled_back = self.store.rollback_to(self, log_id, savepoint);

        let expected = PackedState::compose(TransactionStatus::RollingBack, log_id, last.has_rollback());
        let reopened = self.state.reopen_at(self.transaction_id, expected, savepoint);

        rolled_back?;
        reopened?;
        event!(Level::DEBUG, from = log_id, to = savepoint, "rolled back to savepoint");
        Ok(())
    }

    /// Undo every change and close, even when nothing was written
    pub fn rollback(&self) -> Result<()> {
        let span = info_span!(
            "transaction.rollback",
            transaction_id = self.transaction_id,
            sequence_num = self.sequence_num
        );
        let _enter = span.enter();

        self.mark_statement_end()?;
        let before = self.transition(TransactionStatus::RolledBack)?;
        let log_id = before.log_id();
        let rolled_back = if log_id > 0 {
            self.store.rollback_to(self, log_id, 0)
        } else {
            Ok(())
        };
        let ended = self
            .store
            .end_transaction(self, log_id > 0 || before.has_rollback());
        debug!("Transaction {} rolled back {} changes", self, log_id);
        rolled_back.and(ended)
    }

    /// Changes made after `savepoint`, newest first, each with the value it replaced
    pub fn get_changes(&self, savepoint: u64) -> Result<ChangeIter> {
        self.store.get_changes(self, self.log_id(), savepoint)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        f.debug_struct("Transaction")
            .field("transaction_id", &self.transaction_id)
            .field("sequence_num", &self.sequence_num)
            .field("status", &state.status())
            .field("log_id", &state.log_id())
            .field("has_rollback", &state.has_rollback())
            .finish()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        write!(
            f,
            "{}({}) {} {}",
            self.transaction_id,
            self.sequence_num,
            state.status(),
            state.log_id()
        )
    }
}
