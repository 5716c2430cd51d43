use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use taskvault_core::chunk::{chunk_id, split_rows, DEFAULT_CHUNK_SIZE};
use taskvault_core::{
    content_checksum, BackupChunk, BackupIndexEntry, BackupKind, BackupMetadata, BackupRecord,
    EngineError, Result, Table, TableData, TableStats,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::kv::{get_json, put_json, KvStore};
use crate::rows::RowStore;

const INDEX_KEY: &str = "backup_index";

fn backup_key(id: Uuid) -> String {
    format!("backup:{id}")
}

fn chunk_key(chunk_id: &str) -> String {
    format!("chunk:{chunk_id}")
}

/// Backups inside the window are kept unconditionally; older ones fill
/// remaining capacity up to `max_backups`. The newest full backup is always
/// kept, whatever its age.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_backups: usize,
    pub retention_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_backups: 10,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub chunk_size: usize,
    pub retention: RetentionPolicy,
    /// Recorded in every backup's metadata.
    pub app_version: String,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retention: RetentionPolicy::default(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Creates, chunks, persists, lists, deletes, and restores backups of the
/// host application's row tables, and enforces the retention policy.
pub struct SnapshotStore {
    kv: Arc<dyn KvStore>,
    rows: Arc<dyn RowStore>,
    options: SnapshotOptions,
    backup_in_flight: AtomicBool,
    last_backup_at: Mutex<Option<DateTime<Utc>>>,
}

/// Releases the in-flight flag on every exit path out of `perform_backup`.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SnapshotStore {
    pub async fn open(
        kv: Arc<dyn KvStore>,
        rows: Arc<dyn RowStore>,
        options: SnapshotOptions,
    ) -> Result<Self> {
        let index: Vec<BackupIndexEntry> =
            get_json(kv.as_ref(), INDEX_KEY).await?.unwrap_or_default();
        let last = index.first().map(|e| e.metadata.timestamp);
        Ok(Self {
            kv,
            rows,
            options,
            backup_in_flight: AtomicBool::new(false),
            last_backup_at: Mutex::new(last),
        })
    }

    /// Collects modified rows, chunks them, and persists a new backup.
    /// Rejects with [`EngineError::BackupInProgress`] while another backup is
    /// in flight; concurrent calls are never queued. The index entry is
    /// written last so a failed attempt leaves nothing visible.
    pub async fn perform_backup(&self, kind: BackupKind) -> Result<Uuid> {
        if self
            .backup_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::BackupInProgress);
        }
        let _guard = InFlightGuard(&self.backup_in_flight);

        let id = Uuid::new_v4();
        let timestamp = Utc::now();
        let mut index = self.load_index().await?;

        let (since, previous_backup_id) = match (kind, index.first()) {
            (BackupKind::Incremental, Some(prev)) => (prev.metadata.timestamp, Some(prev.id)),
            _ => (DateTime::<Utc>::UNIX_EPOCH, None),
        };

        let mut data = TableData::new();
        for table in Table::ALL {
            let rows = self.rows.select_modified_since(table, since).await?;
            data.insert(table, rows);
        }

        let payload = serde_json::to_vec(&data).context("serialize backup payload")?;
        let checksum = content_checksum(&payload);
        let metadata = BackupMetadata {
            version: self.options.app_version.clone(),
            timestamp,
            kind,
            checksum,
            previous_backup_id,
            tables: self.table_stats().await?,
        };

        let mut chunks: Vec<BackupChunk> = Vec::new();
        for (table, rows) in &data {
            for group in split_rows(rows, self.options.chunk_size) {
                let seq = chunks.len() as u32;
                chunks.push(BackupChunk {
                    id: chunk_id(id, seq),
                    backup_id: id,
                    seq,
                    table: *table,
                    rows: group,
                    metadata: None,
                });
            }
        }
        if let Some(first) = chunks.first_mut() {
            first.metadata = Some(metadata.clone());
        }

        let chunk_count = chunks.len() as u32;
        for chunk in &chunks {
            put_json(self.kv.as_ref(), &chunk_key(&chunk.id), chunk).await?;
        }

        let record = BackupRecord {
            id,
            metadata: metadata.clone(),
            chunk_count,
        };
        put_json(self.kv.as_ref(), &backup_key(id), &record).await?;

        index.insert(0, BackupIndexEntry { id, metadata });
        self.save_index(&index).await?;

        *self
            .last_backup_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(timestamp);

        info!(backup_id = %id, kind = ?kind, chunks = chunk_count, "backup created");
        Ok(id)
    }

    /// Restores `id` by upserting every row it contains. An incremental
    /// backup is resolved to its full lineage: the `previous_backup_id`
    /// chain is walked back to the full anchor and applied oldest-to-newest,
    /// each backup checksum-verified before any of its rows are written.
    pub async fn restore_backup(&self, id: Uuid) -> Result<()> {
        let chain = self.resolve_chain(id).await?;
        for record in &chain {
            let data = self.load_and_verify(record).await?;
            self.rows.upsert_all(&data).await?;
            debug!(backup_id = %record.id, kind = ?record.metadata.kind, "applied backup delta");
        }
        info!(backup_id = %id, applied = chain.len(), "restore complete");
        Ok(())
    }

    /// Index entries, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupIndexEntry>> {
        let mut index = self.load_index().await?;
        index.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
        Ok(index)
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(get_json(self.kv.as_ref(), &backup_key(id)).await?)
    }

    /// Every chunk of `id`, in write order. Fails with
    /// [`EngineError::BackupNotFound`] for unknown ids.
    pub async fn backup_chunks(&self, id: Uuid) -> Result<Vec<BackupChunk>> {
        let record = self
            .get_backup(id)
            .await?
            .ok_or(EngineError::BackupNotFound(id))?;
        let mut chunks = Vec::with_capacity(record.chunk_count as usize);
        for seq in 0..record.chunk_count {
            let key = chunk_key(&chunk_id(id, seq));
            let chunk: BackupChunk = get_json(self.kv.as_ref(), &key)
                .await?
                .ok_or_else(|| missing_chunk(id, seq))?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Deletes chunks, then the record, then the index entry. Deleting an
    /// unknown id is a no-op.
    pub async fn delete_backup(&self, id: Uuid) -> Result<()> {
        let Some(record) = self.get_backup(id).await? else {
            return Ok(());
        };
        for seq in 0..record.chunk_count {
            self.kv.delete(&chunk_key(&chunk_id(id, seq))).await?;
        }
        self.kv.delete(&backup_key(id)).await?;

        let mut index = self.load_index().await?;
        index.retain(|e| e.id != id);
        self.save_index(&index).await?;
        debug!(backup_id = %id, "backup deleted");
        Ok(())
    }

    /// Walks the index newest-first: the first full backup encountered is
    /// kept whatever its age, entries inside the retention window are kept,
    /// and older entries fill remaining capacity up to `max_backups`.
    /// Everything else is deleted. Returns the deleted ids.
    pub async fn clean_old_backups(&self) -> Result<Vec<Uuid>> {
        let index = self.list_backups().await?;
        let cutoff = Utc::now() - Duration::days(self.options.retention.retention_days);
        let max = self.options.retention.max_backups;

        let mut kept = 0usize;
        let mut kept_full = false;
        let mut doomed = Vec::new();
        for entry in &index {
            if !kept_full && entry.metadata.kind == BackupKind::Full {
                kept_full = true;
                kept += 1;
            } else if entry.metadata.timestamp >= cutoff || kept < max {
                kept += 1;
            } else {
                doomed.push(entry.id);
            }
        }

        for id in &doomed {
            self.delete_backup(*id).await?;
        }
        if !doomed.is_empty() {
            info!(removed = doomed.len(), kept, "retention cleanup removed old backups");
        }
        Ok(doomed)
    }

    /// Row count and most recent modification per tracked table.
    pub async fn table_stats(&self) -> Result<BTreeMap<Table, TableStats>> {
        let mut stats = BTreeMap::new();
        for table in Table::ALL {
            stats.insert(
                table,
                TableStats {
                    row_count: self.rows.count(table).await?,
                    last_modified: self.rows.last_modified(table).await?,
                },
            );
        }
        Ok(stats)
    }

    /// Application version recorded in backup metadata and rollback points.
    pub fn app_version(&self) -> &str {
        &self.options.app_version
    }

    pub fn last_backup_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_backup_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn resolve_chain(&self, id: Uuid) -> Result<Vec<BackupRecord>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let record = self
                .get_backup(current)
                .await?
                .ok_or(EngineError::BackupNotFound(current))?;
            cursor = match record.metadata.kind {
                BackupKind::Full => None,
                BackupKind::Incremental => record.metadata.previous_backup_id,
            };
            chain.push(record);
        }
        chain.reverse();
        Ok(chain)
    }

    async fn load_and_verify(&self, record: &BackupRecord) -> Result<TableData> {
        let mut data: TableData = Table::ALL.iter().map(|t| (*t, Vec::new())).collect();
        for seq in 0..record.chunk_count {
            let key = chunk_key(&chunk_id(record.id, seq));
            let chunk: BackupChunk = get_json(self.kv.as_ref(), &key)
                .await?
                .ok_or_else(|| missing_chunk(record.id, seq))?;
            data.entry(chunk.table).or_default().extend(chunk.rows);
        }

        let payload = serde_json::to_vec(&data).context("serialize reassembled payload")?;
        let actual = content_checksum(&payload);
        if actual != record.metadata.checksum {
            return Err(EngineError::ChecksumMismatch {
                backup_id: record.id,
                expected: record.metadata.checksum.clone(),
                actual,
            });
        }
        Ok(data)
    }

    async fn load_index(&self) -> Result<Vec<BackupIndexEntry>> {
        Ok(get_json(self.kv.as_ref(), INDEX_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_index(&self, index: &[BackupIndexEntry]) -> Result<()> {
        Ok(put_json(self.kv.as_ref(), INDEX_KEY, &index).await?)
    }
}

fn missing_chunk(backup_id: Uuid, seq: u32) -> EngineError {
    EngineError::Storage(anyhow!("backup {backup_id} is missing chunk {seq}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::rows::MemoryRowStore;
    use anyhow::Result as AnyResult;
    use serde_json::json;
    use taskvault_core::Row;
    use tokio::sync::Notify;

    fn issue(id: usize, modified: DateTime<Utc>) -> Row {
        json!({
            "id": format!("issue-{id:05}"),
            "title": format!("issue {id}"),
            "last_modified": modified.to_rfc3339(),
        })
    }

    async fn open_store(
        rows: Arc<MemoryRowStore>,
        options: SnapshotOptions,
    ) -> (Arc<MemoryKvStore>, SnapshotStore) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = SnapshotStore::open(kv.clone(), rows, options)
            .await
            .expect("open store");
        (kv, store)
    }

    async fn seed_issues(rows: &MemoryRowStore, n: usize, modified: DateTime<Utc>) {
        for i in 0..n {
            rows.insert(Table::Issues, issue(i, modified)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_backup_chunks_large_tables() {
        let rows = Arc::new(MemoryRowStore::new());
        seed_issues(&rows, 2500, Utc::now()).await;
        let (_kv, store) = open_store(rows, SnapshotOptions::default()).await;

        let id = store.perform_backup(BackupKind::Full).await.unwrap();
        let record = store.get_backup(id).await.unwrap().unwrap();
        assert_eq!(record.chunk_count, 3);
        assert_eq!(record.metadata.tables[&Table::Issues].row_count, 2500);

        let chunks = store.backup_chunks(id).await.unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.rows.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        // lineage metadata rides on the first chunk only
        assert!(chunks[0].metadata.is_some());
        assert!(chunks[1..].iter().all(|c| c.metadata.is_none()));
    }

    #[tokio::test]
    async fn chunk_count_sums_across_tables() {
        let rows = Arc::new(MemoryRowStore::new());
        let now = Utc::now();
        seed_issues(&rows, 1500, now).await;
        for i in 0..3 {
            rows.insert(
                Table::Users,
                json!({ "id": format!("u{i}"), "last_modified": now.to_rfc3339() }),
            )
            .await
            .unwrap();
        }
        let (_kv, store) = open_store(rows, SnapshotOptions::default()).await;

        let id = store.perform_backup(BackupKind::Full).await.unwrap();
        let record = store.get_backup(id).await.unwrap().unwrap();
        // 2 chunks of issues + 1 of users; empty tables contribute none
        assert_eq!(record.chunk_count, 3);
    }

    #[tokio::test]
    async fn incremental_collects_only_newer_rows() {
        let rows = Arc::new(MemoryRowStore::new());
        seed_issues(&rows, 50, Utc::now() - Duration::hours(1)).await;
        let (_kv, store) = open_store(rows.clone(), SnapshotOptions::default()).await;

        let full_id = store.perform_backup(BackupKind::Full).await.unwrap();

        let later = Utc::now() + Duration::seconds(1);
        rows.insert(Table::Issues, issue(3, later)).await.unwrap();
        rows.insert(Table::Issues, issue(9999, later)).await.unwrap();

        let inc_id = store.perform_backup(BackupKind::Incremental).await.unwrap();
        let record = store.get_backup(inc_id).await.unwrap().unwrap();
        assert_eq!(record.metadata.previous_backup_id, Some(full_id));

        let chunks = store.backup_chunks(inc_id).await.unwrap();
        let total_rows: usize = chunks.iter().map(|c| c.rows.len()).sum();
        assert_eq!(total_rows, 2);
    }

    #[tokio::test]
    async fn incremental_without_history_collects_everything() {
        let rows = Arc::new(MemoryRowStore::new());
        seed_issues(&rows, 5, Utc::now()).await;
        let (_kv, store) = open_store(rows, SnapshotOptions::default()).await;

        let id = store.perform_backup(BackupKind::Incremental).await.unwrap();
        let record = store.get_backup(id).await.unwrap().unwrap();
        assert_eq!(record.metadata.previous_backup_id, None);
        let chunks = store.backup_chunks(id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.rows.len()).sum::<usize>(), 5);
    }

    /// Row store that parks the first select until released, so a second
    /// backup can be attempted while the first is mid-collection.
    struct GatedRows {
        inner: MemoryRowStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl RowStore for GatedRows {
        async fn select_modified_since(
            &self,
            table: Table,
            since: DateTime<Utc>,
        ) -> AnyResult<Vec<Row>> {
            if table == Table::Users {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.select_modified_since(table, since).await
        }

        async fn upsert_all(&self, data: &TableData) -> AnyResult<()> {
            self.inner.upsert_all(data).await
        }

        async fn count(&self, table: Table) -> AnyResult<u64> {
            self.inner.count(table).await
        }

        async fn last_modified(&self, table: Table) -> AnyResult<Option<DateTime<Utc>>> {
            self.inner.last_modified(table).await
        }

        async fn schema_version(&self) -> AnyResult<i64> {
            self.inner.schema_version().await
        }
    }

    #[tokio::test]
    async fn concurrent_backup_is_rejected_not_queued() {
        let gated = Arc::new(GatedRows {
            inner: MemoryRowStore::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let kv = Arc::new(MemoryKvStore::new());
        let store = Arc::new(
            SnapshotStore::open(kv, gated.clone(), SnapshotOptions::default())
                .await
                .unwrap(),
        );

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.perform_backup(BackupKind::Full).await })
        };
        gated.entered.notified().await;

        let second = store.perform_backup(BackupKind::Full).await;
        assert!(matches!(second, Err(EngineError::BackupInProgress)));

        gated.release.notify_one();
        first.await.unwrap().unwrap();

        // guard released: a fresh backup goes through
        gated.release.notify_one();
        store.perform_backup(BackupKind::Full).await.unwrap();
    }

    #[tokio::test]
    async fn failed_backup_releases_the_guard_and_stays_invisible() {
        struct FailingRows;

        #[async_trait::async_trait]
        impl RowStore for FailingRows {
            async fn select_modified_since(
                &self,
                _table: Table,
                _since: DateTime<Utc>,
            ) -> AnyResult<Vec<Row>> {
                anyhow::bail!("row store offline")
            }

            async fn upsert_all(&self, _data: &TableData) -> AnyResult<()> {
                anyhow::bail!("row store offline")
            }

            async fn count(&self, _table: Table) -> AnyResult<u64> {
                anyhow::bail!("row store offline")
            }

            async fn last_modified(&self, _table: Table) -> AnyResult<Option<DateTime<Utc>>> {
                anyhow::bail!("row store offline")
            }

            async fn schema_version(&self) -> AnyResult<i64> {
                anyhow::bail!("row store offline")
            }
        }

        let kv = Arc::new(MemoryKvStore::new());
        let store = SnapshotStore::open(kv, Arc::new(FailingRows), SnapshotOptions::default())
            .await
            .unwrap();

        let err = store.perform_backup(BackupKind::Full).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        // not BackupInProgress: the drop guard released the flag
        let err = store.perform_backup(BackupKind::Full).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        // no partial backup is visible through the index
        assert!(store.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_upserts_rows_back() {
        let rows = Arc::new(MemoryRowStore::new());
        let t0 = Utc::now() - Duration::hours(1);
        rows.insert(Table::Issues, issue(1, t0)).await.unwrap();
        rows.insert(Table::Issues, issue(2, t0)).await.unwrap();
        let (_kv, store) = open_store(rows.clone(), SnapshotOptions::default()).await;

        let id = store.perform_backup(BackupKind::Full).await.unwrap();

        // mutate one row and add another after the backup
        let later = Utc::now();
        rows.insert(
            Table::Issues,
            json!({ "id": "issue-00001", "title": "changed", "last_modified": later.to_rfc3339() }),
        )
        .await
        .unwrap();
        rows.insert(Table::Issues, issue(7, later)).await.unwrap();

        store.restore_backup(id).await.unwrap();

        let restored = rows.get(Table::Issues, "issue-00001").await.unwrap();
        assert_eq!(restored["title"], "issue 1");
        // restore upserts; rows created after the backup are untouched
        assert!(rows.get(Table::Issues, "issue-00007").await.is_some());
    }

    #[tokio::test]
    async fn restoring_an_incremental_replays_the_chain() {
        let rows = Arc::new(MemoryRowStore::new());
        let t0 = Utc::now() - Duration::hours(2);
        rows.insert(
            Table::Issues,
            json!({ "id": "a", "state": "open", "last_modified": t0.to_rfc3339() }),
        )
        .await
        .unwrap();
        rows.insert(
            Table::Issues,
            json!({ "id": "b", "state": "open", "last_modified": t0.to_rfc3339() }),
        )
        .await
        .unwrap();
        let (kv, store) = open_store(rows.clone(), SnapshotOptions::default()).await;
        store.perform_backup(BackupKind::Full).await.unwrap();

        let t1 = Utc::now() + Duration::seconds(1);
        rows.insert(
            Table::Issues,
            json!({ "id": "a", "state": "closed", "last_modified": t1.to_rfc3339() }),
        )
        .await
        .unwrap();
        let inc = store.perform_backup(BackupKind::Incremental).await.unwrap();

        // wipe live state, then restore the incremental alone
        let fresh = Arc::new(MemoryRowStore::new());
        let store2 = SnapshotStore::open(kv, fresh.clone(), SnapshotOptions::default())
            .await
            .unwrap();
        store2.restore_backup(inc).await.unwrap();

        // the full anchor's rows arrived, with the incremental delta on top
        let a = fresh.get(Table::Issues, "a").await.unwrap();
        assert_eq!(a["state"], "closed");
        assert!(fresh.get(Table::Issues, "b").await.is_some());
    }

    #[tokio::test]
    async fn restore_of_unknown_backup_fails_without_mutation() {
        let rows = Arc::new(MemoryRowStore::new());
        seed_issues(&rows, 2, Utc::now()).await;
        let (_kv, store) = open_store(rows.clone(), SnapshotOptions::default()).await;

        let err = store.restore_backup(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::BackupNotFound(_)));
        assert_eq!(rows.count(Table::Issues).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tampered_chunk_fails_checksum_verification() {
        let rows = Arc::new(MemoryRowStore::new());
        seed_issues(&rows, 3, Utc::now()).await;
        let (kv, store) = open_store(rows.clone(), SnapshotOptions::default()).await;

        let id = store.perform_backup(BackupKind::Full).await.unwrap();

        // flip a row inside the stored chunk
        let key = format!("chunk:{}", chunk_id(id, 0));
        let raw = kv.get(&key).await.unwrap().unwrap();
        let mut chunk: BackupChunk = serde_json::from_str(&raw).unwrap();
        chunk.rows[0]["title"] = json!("tampered");
        kv.put(&key, serde_json::to_string(&chunk).unwrap())
            .await
            .unwrap();

        let err = store.restore_backup(id).await.unwrap_err();
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }));
        // nothing was applied
        let row = rows.get(Table::Issues, "issue-00000").await.unwrap();
        assert_ne!(row["title"], "tampered");
    }

    #[tokio::test]
    async fn delete_removes_backup_and_is_idempotent() {
        let rows = Arc::new(MemoryRowStore::new());
        seed_issues(&rows, 10, Utc::now()).await;
        let (kv, store) = open_store(rows, SnapshotOptions::default()).await;

        let keep = store.perform_backup(BackupKind::Full).await.unwrap();
        let doomed = store.perform_backup(BackupKind::Full).await.unwrap();

        store.delete_backup(doomed).await.unwrap();
        let listed = store.list_backups().await.unwrap();
        assert!(listed.iter().all(|e| e.id != doomed));
        assert!(listed.iter().any(|e| e.id == keep));
        assert!(kv
            .get(&format!("chunk:{}", chunk_id(doomed, 0)))
            .await
            .unwrap()
            .is_none());

        // deleting again is a no-op
        store.delete_backup(doomed).await.unwrap();
        store.delete_backup(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let rows = Arc::new(MemoryRowStore::new());
        let (_kv, store) = open_store(rows, SnapshotOptions::default()).await;
        for _ in 0..4 {
            store.perform_backup(BackupKind::Full).await.unwrap();
        }
        let listed = store.list_backups().await.unwrap();
        assert!(listed
            .windows(2)
            .all(|w| w[0].metadata.timestamp >= w[1].metadata.timestamp));
    }

    /// Rewrites a backup's timestamps in place, emulating age.
    async fn backdate(kv: &MemoryKvStore, id: Uuid, ago: Duration) {
        let when = Utc::now() - ago;
        let record_key = backup_key(id);
        let raw = kv.get(&record_key).await.unwrap().unwrap();
        let mut record: BackupRecord = serde_json::from_str(&raw).unwrap();
        record.metadata.timestamp = when;
        kv.put(&record_key, serde_json::to_string(&record).unwrap())
            .await
            .unwrap();

        let raw = kv.get(INDEX_KEY).await.unwrap().unwrap();
        let mut index: Vec<BackupIndexEntry> = serde_json::from_str(&raw).unwrap();
        for entry in &mut index {
            if entry.id == id {
                entry.metadata.timestamp = when;
            }
        }
        kv.put(INDEX_KEY, serde_json::to_string(&index).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retention_keeps_cap_window_and_a_full_backup() {
        let rows = Arc::new(MemoryRowStore::new());
        let (kv, store) = open_store(rows, SnapshotOptions::default()).await;

        // 15 full backups, one per day going back two weeks
        let mut ids = Vec::new();
        for _ in 0..15 {
            ids.push(store.perform_backup(BackupKind::Full).await.unwrap());
        }
        for (i, id) in ids.iter().enumerate() {
            backdate(&kv, *id, Duration::days((14 - i as i64).max(0))).await;
        }

        let removed = store.clean_old_backups().await.unwrap();
        let kept = store.list_backups().await.unwrap();

        assert_eq!(kept.len(), 10);
        assert_eq!(removed.len(), 5);
        assert!(kept.iter().any(|e| e.metadata.kind == BackupKind::Full));
        // everything inside the window survived
        let cutoff = Utc::now() - Duration::days(7);
        assert!(kept
            .iter()
            .filter(|e| e.metadata.timestamp >= cutoff)
            .count()
            >= 6);
    }

    #[tokio::test]
    async fn retention_keeps_a_stale_full_even_over_capacity() {
        let rows = Arc::new(MemoryRowStore::new());
        let options = SnapshotOptions {
            retention: RetentionPolicy {
                max_backups: 1,
                retention_days: 7,
            },
            ..SnapshotOptions::default()
        };
        let (kv, store) = open_store(rows, options).await;

        let full = store.perform_backup(BackupKind::Full).await.unwrap();
        let inc = store.perform_backup(BackupKind::Incremental).await.unwrap();
        backdate(&kv, full, Duration::days(40)).await;
        backdate(&kv, inc, Duration::days(30)).await;

        store.clean_old_backups().await.unwrap();
        let kept = store.list_backups().await.unwrap();

        // the incremental filled the single capacity slot, and the stale
        // full is retained on top of it
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|e| e.id == full));
    }

    #[tokio::test]
    async fn last_backup_time_tracks_newest() {
        let rows = Arc::new(MemoryRowStore::new());
        let (_kv, store) = open_store(rows, SnapshotOptions::default()).await;
        assert!(store.last_backup_at().is_none());
        store.perform_backup(BackupKind::Full).await.unwrap();
        assert!(store.last_backup_at().is_some());
    }
}
