pub mod epoch;
pub mod map;
pub mod persistence;
pub mod store;

pub use epoch::{Epoch, stable_sample};
pub use map::{Cursor, Decision, MvMap, RootReference};
pub use persistence::{SnapshotFile, StoreImage};
pub use store::{MvStore, TxCounter};
