use std::path::{Path, PathBuf};

/// Highest transaction id that fits into an operation id next to a 40-bit log id.
pub const TRANSACTION_ID_LIMIT: u32 = (1 << 24) - 1;

/// Store configuration
///
/// Construct with [`StoreConfig::new`] and chain setters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Snapshot file; `None` keeps the store purely in memory
    pub path: Option<PathBuf>,

    /// Reject all writes; uncommitted entries without undo data read as absent
    pub read_only: bool,

    /// Persist the store whenever a transaction ends with changes
    pub auto_commit: bool,

    /// Highest transaction id slot handed out by the transaction store
    pub max_transaction_id: u32,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self {
            path: None,
            read_only: false,
            auto_commit: true,
            max_transaction_id: 0xFFFF,
        }
    }

    /// Set the snapshot file
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Open the store read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enable or disable persisting on transaction end
    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Set the highest transaction id (clamped to what an operation id can carry)
    pub fn max_transaction_id(mut self, max: u32) -> Self {
        self.max_transaction_id = max.clamp(1, TRANSACTION_ID_LIMIT);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
