pub mod flags;
pub mod kv;
pub mod rows;
pub mod snapshot;
pub mod sqlite_kv;
pub mod sqlite_rows;

pub use flags::{FeatureFlag, FlagStore, KvFlagStore};
pub use kv::{KvStore, MemoryKvStore};
pub use rows::{MemoryRowStore, RowStore};
pub use snapshot::{RetentionPolicy, SnapshotOptions, SnapshotStore};
pub use sqlite_kv::SqliteKvStore;
pub use sqlite_rows::SqliteRowStore;
