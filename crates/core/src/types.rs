use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single row of one of the host application's logical tables. The engine
/// treats rows as opaque JSON; interpreting fields is the row store's job.
pub type Row = serde_json::Value;

/// Collected rows grouped per table. A `BTreeMap` keyed by [`Table`] keeps
/// serialization order deterministic, which the content checksum relies on.
pub type TableData = BTreeMap<Table, Vec<Row>>;

/// The logical tables the engine snapshots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Users,
    Issues,
    SyncQueue,
    SyncMetrics,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Users,
        Table::Issues,
        Table::SyncQueue,
        Table::SyncMetrics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Issues => "issues",
            Table::SyncQueue => "sync_queue",
            Table::SyncMetrics => "sync_metrics",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

/// Per-table row count and most recent modification, captured at backup time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub row_count: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Description of one snapshot. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub kind: BackupKind,
    pub checksum: String,
    /// Lineage pointer for incremental backups; `None` for full backups.
    pub previous_backup_id: Option<Uuid>,
    pub tables: BTreeMap<Table, TableStats>,
}

/// A bounded slice of one table's rows belonging to one backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupChunk {
    pub id: String,
    pub backup_id: Uuid,
    pub seq: u32,
    pub table: Table,
    pub rows: Vec<Row>,
    /// Carried on the first chunk only, so the chunk stream alone is enough
    /// to identify the backup and its lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BackupMetadata>,
}

/// The durable per-backup record. Written after every chunk and before the
/// index entry, so a partially persisted backup is never reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub metadata: BackupMetadata,
    pub chunk_count: u32,
}

/// `{id, metadata}` pointer used for listing and ordering backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupIndexEntry {
    pub id: Uuid,
    pub metadata: BackupMetadata,
}
