// ============================================================================
// Transactional Map View
// ============================================================================
//
// A `TransactionMap` is one transaction's view of one base map. Reads pick
// the version visible to the transaction: committed values, the
// transaction's own writes below the statement boundary (`read_log_id`), and
// values of transactions that are finishing their commit. Anything else is
// resolved by walking the undo log backwards to the value it replaced.
//
// Writes are optimistic. Every write logs the value it replaces before
// touching the base map and gives the log slot back if the base map's CAS
// fails. A key holding another open transaction's uncommitted value cannot be
// written; the caller decides whether to retry.
//
// ============================================================================

use super::snapshot::TxSnapshot;
use super::txn::Transaction;
use super::versioned::{COMMITTED, VersionedValue, log_id_of, transaction_id_of};
use crate::core::{DbError, Result, Value};
use crate::storage::{Cursor, MvMap};
use log::debug;
use std::ops::Bound;
use std::sync::Arc;

/// Statement boundary that hides nothing the transaction wrote
const READ_ALL: u64 = u64::MAX;

#[derive(Clone)]
pub struct TransactionMap {
    transaction: Arc<Transaction>,
    map: Arc<MvMap<Value, VersionedValue>>,
    read_log_id: u64,
}

impl TransactionMap {
    pub(crate) fn new(transaction: Arc<Transaction>, map: Arc<MvMap<Value, VersionedValue>>) -> Self {
        Self { transaction, map, read_log_id: READ_ALL }
    }

    pub fn name(&self) -> &str {
        self.map.name()
    }

    pub fn id(&self) -> u32 {
        self.map.id()
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Underlying base map, holding raw versioned values
    pub fn base_map(&self) -> &Arc<MvMap<Value, VersionedValue>> {
        &self.map
    }

    /// Hide this transaction's writes made at or after `log_id`.
    ///
    /// Set it to the savepoint taken at the start of a statement so the
    /// statement does not see its own writes.
    pub fn set_statement_snapshot(&mut self, log_id: u64) {
        self.read_log_id = log_id;
    }

    /// A copy of this view with the given statement boundary
    pub fn with_statement_snapshot(&self, log_id: u64) -> Self {
        Self { read_log_id: log_id, ..self.clone() }
    }

    pub fn read_log_id(&self) -> u64 {
        self.read_log_id
    }

    fn snapshot(&self) -> Result<TxSnapshot> {
        self.transaction.store().snapshot(&self.map)
    }

    // ========================================================================
    // Visibility
    // ========================================================================

    /// Walk from `raw` back through the undo log to the version this view may see
    fn resolve(
        &self,
        key: &Value,
        mut raw: Option<VersionedValue>,
        snapshot: &TxSnapshot,
        read_log_id: u64,
    ) -> Result<Option<VersionedValue>> {
        let own_id = self.transaction.id();
        let store = self.transaction.store();
        loop {
            let Some(current) = raw else {
                return Ok(None);
            };
            let operation = current.operation_id();
            if operation == COMMITTED {
                return Ok(Some(current));
            }
            let writer = transaction_id_of(operation);
            if writer == own_id {
                if log_id_of(operation) < read_log_id {
                    return Ok(Some(current));
                }
            } else if snapshot.committing.contains(writer) {
                return Ok(Some(current));
            }

            let record = match snapshot.undo_root.get(&operation) {
                Some(record) => Some(record.clone()),
                None => store.undo_log().get(&operation)?,
            };
            raw = match record {
                Some(record) => record.old_value().cloned(),
                // the writer finished after the snapshot was taken
                None if store.is_read_only() => return Ok(None),
                None => {
                    let latest = self.map.get(key)?;
                    if latest.as_ref().map(VersionedValue::operation_id) == Some(operation) {
                        return Err(DbError::Corruption(format!(
                            "Undo entry {:#x} for key {} in map '{}' is missing",
                            operation,
                            key,
                            self.name()
                        )));
                    }
                    latest
                }
            };
        }
    }

    fn visible(&self, key: &Value, snapshot: &TxSnapshot, read_log_id: u64) -> Result<Option<VersionedValue>> {
        let raw = snapshot.map_root.get(key).cloned();
        self.resolve(key, raw, snapshot, read_log_id)
    }

    fn is_visible_entry(&self, key: &Value, raw: &VersionedValue, snapshot: &TxSnapshot) -> Result<bool> {
        Ok(self
            .resolve(key, Some(raw.clone()), snapshot, self.read_log_id)?
            .is_some_and(|v| !v.is_tombstone()))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Value visible to this transaction, bounded by the statement snapshot
    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        self.get_bounded(key, self.read_log_id)
    }

    /// Value visible to this transaction including writes of the current statement
    pub fn get_latest(&self, key: &Value) -> Result<Option<Value>> {
        self.get_bounded(key, READ_ALL)
    }

    fn get_bounded(&self, key: &Value, read_log_id: u64) -> Result<Option<Value>> {
        self.transaction.check_not_closed()?;
        let snapshot = self.snapshot()?;
        Ok(self
            .visible(key, &snapshot, read_log_id)?
            .and_then(VersionedValue::into_value))
    }

    pub fn contains_key(&self, key: &Value) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// The base map holds a tombstone written by this transaction
    pub fn is_deleted_by_current_transaction(&self, key: &Value) -> Result<bool> {
        self.transaction.check_not_closed()?;
        Ok(self
            .map
            .get(key)?
            .is_some_and(|raw| raw.is_tombstone() && raw.writer() == Some(self.transaction.id())))
    }

    /// The base map holds an uncommitted value written by this transaction
    pub fn is_same_transaction(&self, key: &Value) -> Result<bool> {
        self.transaction.check_not_closed()?;
        Ok(self
            .map
            .get(key)?
            .is_some_and(|raw| raw.writer() == Some(self.transaction.id())))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Set (or with `None` delete) the value of `key`.
    ///
    /// Returns `Ok(false)` when the key is held by another transaction or a
    /// concurrent write won the race; nothing is logged in that case. With
    /// `only_if_unchanged` the write also fails if the base map moved past
    /// the version this view sees.
    pub fn try_set(&self, key: Value, value: Option<Value>, only_if_unchanged: bool) -> Result<bool> {
        self.transaction.check_not_closed()?;
        let own_id = self.transaction.id();
        let current = self.map.get(&key)?;

        if only_if_unchanged {
            let snapshot = self.snapshot()?;
            let visible = self.visible(&key, &snapshot, self.read_log_id)?;
            if visible != current {
                let Some(raw) = &current else {
                    return Ok(false);
                };
                if raw.writer() != Some(own_id) {
                    return Ok(false);
                }
                if value.is_none() {
                    // removing an entry this statement added or changed
                    return Ok(true);
                }
                if !raw.is_tombstone() {
                    return Ok(false);
                }
            }
        }

        let map_id = self.map.id();
        match current {
            None => {
                let operation = self.transaction.log(map_id, key.clone(), None)?;
                let fresh = VersionedValue::uncommitted(operation, value);
                if self.map.put_if_absent(key, fresh)?.is_some() {
                    self.transaction.log_undo()?;
                    return Ok(false);
                }
                Ok(true)
            }
            Some(raw) => match raw.writer() {
                Some(writer) if writer != own_id => {
                    debug!(
                        "Transaction {} blocked on key {} in map '{}' held by transaction {}",
                        own_id,
                        key,
                        self.name(),
                        writer
                    );
                    Ok(false)
                }
                _ => {
                    let operation = self.transaction.log(map_id, key.clone(), Some(raw.clone()))?;
                    let next = VersionedValue::uncommitted(operation, value);
                    if !self.map.replace(&key, &raw, next)? {
                        self.transaction.log_undo()?;
                        return Ok(false);
                    }
                    Ok(true)
                }
            },
        }
    }

    pub fn try_put(&self, key: Value, value: Value) -> Result<bool> {
        self.try_set(key, Some(value), false)
    }

    pub fn try_remove(&self, key: Value) -> Result<bool> {
        self.try_set(key, None, false)
    }

    /// Write `value` and return the previously visible value
    pub fn put(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.set(key, Some(value))
    }

    /// Delete `key` and return the previously visible value
    pub fn remove(&self, key: &Value) -> Result<Option<Value>> {
        self.set(key.clone(), None)
    }

    fn set(&self, key: Value, value: Option<Value>) -> Result<Option<Value>> {
        let old = self.get(&key)?;
        if !self.try_set(key.clone(), value, false)? {
            return Err(self.locked(&key));
        }
        Ok(old)
    }

    /// Write only if no value is visible; returns the visible value otherwise
    pub fn put_if_absent(&self, key: Value, value: Value) -> Result<Option<Value>> {
        let old = self.get(&key)?;
        if old.is_none() && !self.try_set(key.clone(), Some(value), true)? {
            return Err(self.locked(&key));
        }
        Ok(old)
    }

    /// Write an already committed value, bypassing the undo log
    ///
    /// Meant for initial loads; the write cannot be rolled back.
    pub fn put_committed(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.transaction.check_not_closed()?;
        if self.transaction.store().is_read_only() {
            return Err(DbError::ReadOnly);
        }
        let previous = self.map.put(key, VersionedValue::committed(Some(value)))?;
        Ok(previous.and_then(VersionedValue::into_value))
    }

    /// Transactionally delete every visible entry
    pub fn clear(&self) -> Result<()> {
        let keys = self.key_iterator(None, None)?.collect::<Result<Vec<_>>>()?;
        for key in keys {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn locked(&self, key: &Value) -> DbError {
        DbError::EntryLocked { map: self.name().to_string(), key: key.to_string() }
    }

    // ========================================================================
    // Size
    // ========================================================================

    /// Exact number of entries visible to this transaction
    pub fn size_as_long(&self) -> Result<u64> {
        self.transaction.check_not_closed()?;
        let snapshot = self.snapshot()?;
        let size = snapshot.map_root.total_count() as u64;
        let undo_size = snapshot.undo_root.total_count() as u64;

        if undo_size == 0 {
            return Ok(size);
        }
        if undo_size > size {
            let mut count = 0;
            for (key, raw) in snapshot.map_root.cursor(None) {
                if self.is_visible_entry(&key, &raw, &snapshot)? {
                    count += 1;
                }
            }
            return Ok(count);
        }

        let store = self.transaction.store();
        let seen = store.create_temp_map()?;
        let counted = self.subtract_invisible(size, &snapshot, &seen);
        store.remove_temp_map(&seen)?;
        counted
    }

    fn subtract_invisible(&self, size: u64, snapshot: &TxSnapshot, seen: &MvMap<Value, ()>) -> Result<u64> {
        let mut count = size;
        for (_, record) in snapshot.undo_root.cursor(None) {
            if record.map_id() != self.map.id() {
                continue;
            }
            let key = record.key();
            // keys missing from the pinned root were never part of `size`
            let Some(raw) = snapshot.map_root.get(key) else {
                continue;
            };
            if !self.is_visible_entry(key, raw, snapshot)? && seen.put_if_absent(key.clone(), ())?.is_none() {
                count -= 1;
            }
        }
        Ok(count)
    }

    pub fn size(&self) -> Result<u64> {
        self.size_as_long()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.first_key()?.is_none())
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    pub fn first_key(&self) -> Result<Option<Value>> {
        let snapshot = self.snapshot()?;
        self.first_visible(&snapshot, snapshot.map_root.root().iter())
    }

    pub fn last_key(&self) -> Result<Option<Value>> {
        let snapshot = self.snapshot()?;
        self.first_visible(&snapshot, snapshot.map_root.root().iter().rev())
    }

    /// Smallest visible key strictly greater than `key`
    pub fn higher_key(&self, key: &Value) -> Result<Option<Value>> {
        let snapshot = self.snapshot()?;
        let range = (Bound::Excluded(key.clone()), Bound::Unbounded);
        self.first_visible(&snapshot, snapshot.map_root.root().range(range))
    }

    /// Largest visible key strictly smaller than `key`
    pub fn lower_key(&self, key: &Value) -> Result<Option<Value>> {
        let snapshot = self.snapshot()?;
        let range = (Bound::Unbounded, Bound::Excluded(key.clone()));
        self.first_visible(&snapshot, snapshot.map_root.root().range(range).rev())
    }

    fn first_visible<'a, I>(&self, snapshot: &TxSnapshot, candidates: I) -> Result<Option<Value>>
    where
        I: Iterator<Item = (&'a Value, &'a VersionedValue)>,
    {
        self.transaction.check_not_closed()?;
        for (key, raw) in candidates {
            if self.is_visible_entry(key, raw, snapshot)? {
                return Ok(Some(key.clone()));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Visible entries with keys in `[from, to]`, over a snapshot taken now
    pub fn entry_iterator(&self, from: Option<&Value>, to: Option<&Value>) -> Result<EntryIterator> {
        self.transaction.check_not_closed()?;
        let snapshot = self.snapshot()?;
        let cursor = snapshot.map_root.range_cursor(from, to);
        Ok(EntryIterator { view: self.clone(), snapshot, cursor })
    }

    /// Visible keys in `[from, to]`, over a snapshot taken now
    pub fn key_iterator(&self, from: Option<&Value>, to: Option<&Value>) -> Result<KeyIterator> {
        Ok(KeyIterator { entries: self.entry_iterator(from, to)? })
    }
}

impl std::fmt::Debug for TransactionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMap")
            .field("map", &self.map.name())
            .field("transaction", &self.transaction.id())
            .field("read_log_id", &self.read_log_id)
            .finish()
    }
}

/// Forward-only iteration over the entries visible in one snapshot
pub struct EntryIterator {
    view: TransactionMap,
    snapshot: TxSnapshot,
    cursor: Cursor<Value, VersionedValue>,
}

impl Iterator for EntryIterator {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, raw) = self.cursor.next()?;
            let visible = self
                .view
                .resolve(&key, Some(raw), &self.snapshot, self.view.read_log_id);
            match visible {
                Ok(Some(versioned)) => {
                    if let Some(value) = versioned.into_value() {
                        return Some(Ok((key, value)));
                    }
                }
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

pub struct KeyIterator {
    entries: EntryIterator,
}

impl Iterator for KeyIterator {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|entry| entry.map(|(key, _)| key))
    }
}
