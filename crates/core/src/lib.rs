pub mod checksum;
pub mod chunk;
pub mod error;
pub mod types;

pub use checksum::content_checksum;
pub use error::{EngineError, Result};
pub use types::{
    BackupChunk, BackupIndexEntry, BackupKind, BackupMetadata, BackupRecord, Row, Table,
    TableData, TableStats,
};
