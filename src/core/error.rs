use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Transaction {transaction_id} was illegally transitioned from {from} to {to}")]
    IllegalStateTransition {
        transaction_id: u32,
        from: String,
        to: String,
    },

    #[error("Transaction {transaction_id} has status {status}, not OPEN")]
    NotOpen { transaction_id: u32, status: String },

    #[error("Transaction {0} is closed")]
    TransactionClosed(u32),

    #[error("Transaction {0} is too big: undo log id limit reached")]
    TransactionTooBig(u32),

    #[error("Entry is locked: key {key} in map '{map}' is being modified by another transaction")]
    EntryLocked { map: String, key: String },

    #[error("Transaction {0} was concurrently modified while rollback to savepoint was in progress")]
    ConcurrentModification(u32),

    #[error("There are too many open transactions (limit {0})")]
    TooManyOpenTransactions(u32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Map '{0}' not found")]
    MapNotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Store is read-only")]
    ReadOnly,

    #[error("Store is closed")]
    StoreClosed,

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DbError {
    /// Conflicts are the only errors a caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::EntryLocked { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
