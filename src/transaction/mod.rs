// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Multi-version concurrency control over the copy-on-write maps of an
// `MvStore`, with snapshot isolation and optimistic, non-blocking writes.
//
// - versioned: values tagged with the operation that wrote them
// - undo: the shared undo log, one entry per uncommitted write
// - state: packed status / log id / rollback flag and the transition table
// - bitset + snapshot: the committing set and consistent read snapshots
// - txn / map / store: transactions, transactional map views, coordinator
//
// ============================================================================

pub mod bitset;
pub mod change;
pub mod map;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod txn;
pub mod undo;
pub mod versioned;

pub use bitset::BitSet;
pub use change::{Change, ChangeIter};
pub use map::{EntryIterator, KeyIterator, TransactionMap};
pub use snapshot::TxSnapshot;
pub use state::{PackedState, TransactionState, TransactionStatus, is_valid_transition};
pub use store::{TRANSACTION_RECORDS_NAME, TransactionRecord, TransactionStore};
pub use txn::Transaction;
pub use undo::{UNDO_LOG_NAME, UndoRecord};
pub use versioned::{VersionedValue, log_id_of, operation_id, transaction_id_of};
