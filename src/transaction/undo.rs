use super::versioned::VersionedValue;
use crate::core::Value;
use crate::storage::MvMap;
use serde::{Deserialize, Serialize};

/// Name of the shared undo log map
pub const UNDO_LOG_NAME: &str = "undoLog";

/// The shared undo log: operation id -> what that operation overwrote
pub type UndoLog = MvMap<u64, UndoRecord>;

/// Prior state of one key, recorded before a transactional write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    map_id: u32,
    key: Value,
    old_value: Option<VersionedValue>,
}

impl UndoRecord {
    pub fn new(map_id: u32, key: Value, old_value: Option<VersionedValue>) -> Self {
        Self { map_id, key, old_value }
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    /// `None` when the key did not exist before the write
    pub fn old_value(&self) -> Option<&VersionedValue> {
        self.old_value.as_ref()
    }

    pub fn into_parts(self) -> (u32, Value, Option<VersionedValue>) {
        (self.map_id, self.key, self.old_value)
    }
}
