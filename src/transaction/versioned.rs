// ============================================================================
// Versioned Values and Operation Ids
// ============================================================================
//
// Every value stored in a transactional map is tagged with the operation id
// of the write that produced it. An operation id packs the writer's
// transaction id (upper 24 bits) and its undo-log position (lower 40 bits);
// zero means the value is committed and owned by nobody.
//
// ============================================================================

use crate::core::Value;
use serde::{Deserialize, Serialize};

pub const LOG_ID_BITS: u32 = 40;
pub const LOG_ID_LIMIT: u64 = 1 << LOG_ID_BITS;
pub const LOG_ID_MASK: u64 = LOG_ID_LIMIT - 1;

/// Operation id of a committed value
pub const COMMITTED: u64 = 0;

pub fn operation_id(transaction_id: u32, log_id: u64) -> u64 {
    ((transaction_id as u64) << LOG_ID_BITS) | (log_id & LOG_ID_MASK)
}

pub fn transaction_id_of(operation_id: u64) -> u32 {
    (operation_id >> LOG_ID_BITS) as u32
}

pub fn log_id_of(operation_id: u64) -> u64 {
    operation_id & LOG_ID_MASK
}

/// A payload (or tombstone) plus the operation that wrote it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    operation_id: u64,
    value: Option<Value>,
}

impl VersionedValue {
    pub fn committed(value: Option<Value>) -> Self {
        Self { operation_id: COMMITTED, value }
    }

    pub fn uncommitted(operation_id: u64, value: Option<Value>) -> Self {
        Self { operation_id, value }
    }

    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    /// Transaction that owns this value, `None` once committed
    pub fn writer(&self) -> Option<u32> {
        if self.is_committed() {
            None
        } else {
            Some(transaction_id_of(self.operation_id))
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<Value> {
        self.value
    }

    pub fn is_committed(&self) -> bool {
        self.operation_id == COMMITTED
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}
