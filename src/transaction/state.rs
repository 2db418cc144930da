// ============================================================================
// Transaction State Management
// ============================================================================
//
// A transaction's status, undo-log position and rollback flag live in one
// 64-bit word so they always change together:
//
//   bits 41..44  status
//   bit  40      has-rollback flag (sticky)
//   bits  0..39  log id (number of undo entries written)
//
// The word is only ever changed with compare-and-swap, and status changes
// must follow the transition table in `is_valid_transition`.
//
// ============================================================================

use super::versioned::{LOG_ID_BITS, LOG_ID_LIMIT, LOG_ID_MASK};
use crate::core::{DbError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

const ROLLBACK_FLAG: u64 = 1 << LOG_ID_BITS;
const STATUS_SHIFT: u32 = LOG_ID_BITS + 1;
const STATUS_MASK: u64 = 0xF;

/// Transaction status
///
/// State transitions:
/// ```text
/// CLOSED ──begin──> OPEN ──prepare──> PREPARED
///                    │ ▲                 │
///      rollback to   │ │                 │
///        savepoint   ▼ │                 │
///               ROLLING_BACK             │
///                                        ▼
/// OPEN / PREPARED ──commit──> COMMITTING ──> COMMITTED ──> CLOSED
/// OPEN / PREPARED ──rollback──> ROLLED_BACK ──> CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionStatus {
    Closed = 0,
    Open = 1,
    Prepared = 2,
    Committing = 3,
    Committed = 4,
    RollingBack = 5,
    RolledBack = 6,
}

impl TransactionStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Closed),
            1 => Some(Self::Open),
            2 => Some(Self::Prepared),
            3 => Some(Self::Committing),
            4 => Some(Self::Committed),
            5 => Some(Self::RollingBack),
            6 => Some(Self::RolledBack),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
        };
        write!(f, "{}", name)
    }
}

/// Transition table: may a transaction move from `from` to `to`?
pub fn is_valid_transition(from: TransactionStatus, to: TransactionStatus) -> bool {
    use TransactionStatus::*;
    match to {
        Open => matches!(from, Closed | RollingBack),
        RollingBack => matches!(from, Open),
        Prepared => matches!(from, Open),
        // COMMITTING -> COMMITTING is the recovery path finishing an interrupted commit
        Committing => matches!(from, Open | Prepared | Committing),
        Committed => matches!(from, Committing),
        RolledBack => matches!(from, Open | Prepared),
        Closed => matches!(from, Committing | Committed | RolledBack),
    }
}

/// Decoded view of the packed state word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedState(u64);

impl PackedState {
    pub fn compose(status: TransactionStatus, log_id: u64, has_rollback: bool) -> Self {
        let flag = if has_rollback { ROLLBACK_FLAG } else { 0 };
        Self(((status as u64) << STATUS_SHIFT) | flag | (log_id & LOG_ID_MASK))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn status(&self) -> TransactionStatus {
        let raw = ((self.0 >> STATUS_SHIFT) & STATUS_MASK) as u8;
        // only `compose` produces words, so the status bits are always valid
        TransactionStatus::from_u8(raw).unwrap_or(TransactionStatus::Closed)
    }

    pub fn log_id(&self) -> u64 {
        self.0 & LOG_ID_MASK
    }

    pub fn has_rollback(&self) -> bool {
        self.0 & ROLLBACK_FLAG != 0
    }

    pub fn has_changes(&self) -> bool {
        self.log_id() != 0
    }

    /// Same status and flag with the log id advanced by one, if it stays below 2^40
    pub fn next_log(&self) -> Option<Self> {
        let next = self.log_id() + 1;
        if next >= LOG_ID_LIMIT {
            return None;
        }
        Some(Self::compose(self.status(), next, self.has_rollback()))
    }

    /// Same status and flag with the log id moved back by one
    pub fn previous_log(&self) -> Option<Self> {
        let previous = self.log_id().checked_sub(1)?;
        Some(Self::compose(self.status(), previous, self.has_rollback()))
    }
}

/// The atomic word behind a transaction
#[derive(Debug)]
pub struct TransactionState {
    word: AtomicU64,
}

impl TransactionState {
    pub fn new(initial: PackedState) -> Self {
        Self { word: AtomicU64::new(initial.raw()) }
    }

    pub fn load(&self) -> PackedState {
        PackedState(self.word.load(Ordering::Acquire))
    }

    pub fn compare_exchange(&self, expected: PackedState, new: PackedState) -> bool {
        self.word
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` keeping log id and flag; returns the state before the change
    pub fn transition(&self, transaction_id: u32, to: TransactionStatus) -> Result<PackedState> {
        loop {
            let current = self.load();
            let from = current.status();
            if !is_valid_transition(from, to) {
                return Err(DbError::IllegalStateTransition {
                    transaction_id,
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            let next = PackedState::compose(to, current.log_id(), current.has_rollback());
            if self.compare_exchange(current, next) {
                return Ok(current);
            }
        }
    }

    /// Reopen a ROLLING_BACK transaction at `savepoint`, setting the sticky rollback flag.
    ///
    /// Fails with `ConcurrentModification` if the word is no longer `expected`.
    pub fn reopen_at(&self, transaction_id: u32, expected: PackedState, savepoint: u64) -> Result<PackedState> {
        let reopened = PackedState::compose(TransactionStatus::Open, savepoint, true);
        if self.compare_exchange(expected, reopened) {
            Ok(reopened)
        } else {
            Err(DbError::ConcurrentModification(transaction_id))
        }
    }

    /// Reserve the next undo slot of an OPEN transaction; returns the state before the increment
    pub fn increment_log(&self, transaction_id: u32) -> Result<PackedState> {
        loop {
            let current = self.load();
            check_open(transaction_id, current.status())?;
            let next = current
                .next_log()
                .ok_or(DbError::TransactionTooBig(transaction_id))?;
            if self.compare_exchange(current, next) {
                return Ok(current);
            }
        }
    }

    /// Give back the most recently reserved undo slot; returns the state after the decrement
    pub fn decrement_log(&self, transaction_id: u32) -> Result<PackedState> {
        loop {
            let current = self.load();
            let next = current.previous_log().ok_or_else(|| {
                DbError::Corruption(format!("Transaction {} undo log id underflow", transaction_id))
            })?;
            if self.compare_exchange(current, next) {
                return Ok(next);
            }
        }
    }
}

pub(crate) fn check_open(transaction_id: u32, status: TransactionStatus) -> Result<()> {
    match status {
        TransactionStatus::Open => Ok(()),
        TransactionStatus::Closed => Err(DbError::TransactionClosed(transaction_id)),
        other => Err(DbError::NotOpen { transaction_id, status: other.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionStatus::*;

    const ALL: [TransactionStatus; 7] =
        [Closed, Open, Prepared, Committing, Committed, RollingBack, RolledBack];

    #[test]
    fn test_transition_table() {
        let allowed = [
            (Closed, Open),
            (RollingBack, Open),
            (Open, RollingBack),
            (Open, Prepared),
            (Open, Committing),
            (Prepared, Committing),
            (Committing, Committing),
            (Committing, Committed),
            (Open, RolledBack),
            (Prepared, RolledBack),
            (Committing, Closed),
            (Committed, Closed),
            (RolledBack, Closed),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    is_valid_transition(from, to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_packing_round_trips_every_field() {
        let state = PackedState::compose(Prepared, 0xAB_CDEF_1234, true);
        assert_eq!(state.status(), Prepared);
        assert_eq!(state.log_id(), 0xAB_CDEF_1234);
        assert!(state.has_rollback());
        assert!(state.has_changes());

        let fresh = PackedState::compose(Open, 0, false);
        assert!(!fresh.has_changes());
        assert!(!fresh.has_rollback());
    }

    #[test]
    fn test_log_id_limit() {
        let last = PackedState::compose(Open, LOG_ID_LIMIT - 2, false);
        let top = last.next_log().unwrap();
        assert_eq!(top.log_id(), LOG_ID_LIMIT - 1);
        assert!(top.next_log().is_none());
        assert!(PackedState::compose(Open, 0, false).previous_log().is_none());
    }

    #[test]
    fn test_transaction_too_big() {
        let state = TransactionState::new(PackedState::compose(Open, LOG_ID_LIMIT - 1, false));
        assert!(matches!(state.increment_log(5), Err(DbError::TransactionTooBig(5))));
        assert_eq!(state.load().log_id(), LOG_ID_LIMIT - 1);
    }

    #[test]
    fn test_increment_and_decrement() {
        let state = TransactionState::new(PackedState::compose(Open, 0, true));
        assert_eq!(state.increment_log(1).unwrap().log_id(), 0);
        assert_eq!(state.increment_log(1).unwrap().log_id(), 1);
        assert_eq!(state.decrement_log(1).unwrap().log_id(), 1);
        assert!(state.load().has_rollback());
        state.decrement_log(1).unwrap();
        assert!(matches!(state.decrement_log(1), Err(DbError::Corruption(_))));
    }

    #[test]
    fn test_increment_requires_open() {
        let state = TransactionState::new(PackedState::compose(Prepared, 3, false));
        assert!(matches!(state.increment_log(9), Err(DbError::NotOpen { .. })));
        let closed = TransactionState::new(PackedState::compose(Closed, 0, false));
        assert!(matches!(closed.increment_log(9), Err(DbError::TransactionClosed(9))));
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let state = TransactionState::new(PackedState::compose(Open, 4, false));
        let err = state.transition(2, Committed).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Transaction 2 was illegally transitioned from OPEN to COMMITTED"
        );
        assert_eq!(state.load(), PackedState::compose(Open, 4, false));

        let before = state.transition(2, Committing).unwrap();
        assert_eq!(before.status(), Open);
        assert_eq!(state.load().status(), Committing);
        assert_eq!(state.load().log_id(), 4);
    }

    #[test]
    fn test_reopen_at_savepoint_sets_rollback_flag() {
        let state = TransactionState::new(PackedState::compose(Open, 6, false));
        let rolling = state.transition(3, RollingBack).unwrap();
        let expected = PackedState::compose(RollingBack, rolling.log_id(), rolling.has_rollback());

        let reopened = state.reopen_at(3, expected, 2).unwrap();
        assert_eq!(reopened.status(), Open);
        assert_eq!(reopened.log_id(), 2);
        assert!(reopened.has_rollback());
        assert_eq!(state.load(), reopened);
    }

    #[test]
    fn test_reopen_at_detects_concurrent_modification() {
        let state = TransactionState::new(PackedState::compose(Open, 6, false));
        state.transition(3, RollingBack).unwrap();
        let expected = PackedState::compose(RollingBack, 6, false);
        // another thread moved the word while the rollback ran
        state.transition(3, Open).unwrap();

        assert!(matches!(
            state.reopen_at(3, expected, 2),
            Err(DbError::ConcurrentModification(3))
        ));
        assert_eq!(state.load(), PackedState::compose(Open, 6, false));
    }
}
