// ============================================================================
// memtx Library
// ============================================================================

//! Multi-version transactions over a copy-on-write, versioned key/value store.
//!
//! # Examples
//!
//! ```
//! use memtx::{MvStore, TransactionStore, Value};
//! use std::sync::Arc;
//!
//! # fn main() -> memtx::Result<()> {
//! let store = TransactionStore::new(Arc::new(MvStore::in_memory()))?;
//! store.init()?;
//!
//! let tx = store.begin()?;
//! let users = tx.open_map("users")?;
//! users.put(Value::from(1), Value::from("alice"))?;
//! tx.commit()?;
//!
//! let reader = store.begin()?;
//! let users = reader.open_map("users")?;
//! assert_eq!(users.get(&Value::from(1))?, Some(Value::from("alice")));
//! reader.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use config::StoreConfig;
pub use core::{DbError, Result, Value};
pub use storage::{MvMap, MvStore};
pub use transaction::{
    Change, Transaction, TransactionMap, TransactionStatus, TransactionStore, VersionedValue,
};
