use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use taskvault_core::{Row, Table, TableData};
use tokio::sync::Mutex;

/// Contract to the host application's row store, scoped to the four logical
/// tables the engine snapshots. Rows carry their own `id` primary key and
/// `last_modified` timestamp.
#[async_trait::async_trait]
pub trait RowStore: Send + Sync {
    /// Rows of `table` whose last-modified timestamp is strictly greater
    /// than `since`.
    async fn select_modified_since(&self, table: Table, since: DateTime<Utc>) -> Result<Vec<Row>>;

    /// Applies every row in `data` by primary key — insert if absent,
    /// overwrite if present — as a single atomic unit. The restore path
    /// relies on this: either the whole delta lands or none of it does.
    async fn upsert_all(&self, data: &TableData) -> Result<()>;

    async fn count(&self, table: Table) -> Result<u64>;

    async fn last_modified(&self, table: Table) -> Result<Option<DateTime<Utc>>>;

    /// Migration level of the host schema, recorded in rollback points.
    async fn schema_version(&self) -> Result<i64>;
}

/// Primary key of a row. Accepts string or integer ids, normalised to text.
pub fn row_id(row: &Row) -> Result<String> {
    match row.get("id") {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => bail!("row has no usable id field: {row}"),
    }
}

/// The row's `last_modified` field, when present and parseable.
pub fn row_last_modified(row: &Row) -> Option<DateTime<Utc>> {
    let raw = row.get("last_modified")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// In-memory row store for tests. Rows without a `last_modified` field are
/// treated as always modified.
#[derive(Debug)]
pub struct MemoryRowStore {
    tables: Mutex<BTreeMap<Table, BTreeMap<String, Row>>>,
    schema_version: i64,
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Table::ALL.iter().map(|t| (*t, BTreeMap::new())).collect()),
            schema_version: 1,
        }
    }

    pub fn with_schema_version(mut self, version: i64) -> Self {
        self.schema_version = version;
        self
    }

    pub async fn insert(&self, table: Table, row: Row) -> Result<()> {
        let id = row_id(&row)?;
        self.tables
            .lock()
            .await
            .entry(table)
            .or_default()
            .insert(id, row);
        Ok(())
    }

    pub async fn rows(&self, table: Table) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, table: Table, id: &str) -> Option<Row> {
        self.tables
            .lock()
            .await
            .get(&table)
            .and_then(|rows| rows.get(id).cloned())
    }
}

#[async_trait::async_trait]
impl RowStore for MemoryRowStore {
    async fn select_modified_since(&self, table: Table, since: DateTime<Utc>) -> Result<Vec<Row>> {
        let tables = self.tables.lock().await;
        let rows = tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|row| row_last_modified(row).is_none_or(|ts| ts > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn upsert_all(&self, data: &TableData) -> Result<()> {
        let mut tables = self.tables.lock().await;
        for (table, rows) in data {
            let target = tables.entry(*table).or_default();
            for row in rows {
                let id = row_id(row).context("upsert row")?;
                target.insert(id, row.clone());
            }
        }
        Ok(())
    }

    async fn count(&self, table: Table) -> Result<u64> {
        let tables = self.tables.lock().await;
        Ok(tables.get(&table).map(|rows| rows.len() as u64).unwrap_or(0))
    }

    async fn last_modified(&self, table: Table) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&table)
            .and_then(|rows| rows.values().filter_map(row_last_modified).max()))
    }

    async fn schema_version(&self) -> Result<i64> {
        Ok(self.schema_version)
    }
}
