use super::bitset::BitSet;
use super::undo::UndoRecord;
use super::versioned::VersionedValue;
use crate::core::Value;
use crate::storage::{Epoch, RootReference};
use std::sync::Arc;

/// One consistent view used to answer a read, a size query or an iteration
///
/// Holds the map root, the undo log root and the committing set exactly as
/// they were at a single instant.
#[derive(Debug, Clone)]
pub struct TxSnapshot {
    pub(crate) map_root: Arc<RootReference<Value, VersionedValue>>,
    pub(crate) undo_root: Arc<RootReference<u64, UndoRecord>>,
    pub(crate) committing: Arc<BitSet>,
}

impl TxSnapshot {
    pub fn map_root(&self) -> &RootReference<Value, VersionedValue> {
        &self.map_root
    }

    pub fn undo_root(&self) -> &RootReference<u64, UndoRecord> {
        &self.undo_root
    }

    pub fn committing(&self) -> &BitSet {
        &self.committing
    }
}

impl Epoch for TxSnapshot {
    fn same_epoch(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.map_root, &other.map_root)
            && Arc::ptr_eq(&self.undo_root, &other.undo_root)
            && Arc::ptr_eq(&self.committing, &other.committing)
    }
}
