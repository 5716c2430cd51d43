use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use taskvault_core::{Row, Table, TableData};

use crate::rows::{row_id, RowStore};

const SCHEMA_VERSION: i64 = 1;

/// SQLite mirror of the host application's four logical tables. Each table
/// stores the full row as JSON alongside the columns the engine queries on.
/// Connections are opened per operation inside `spawn_blocking`, matching the
/// key-value backend.
pub struct SqliteRowStore {
    db_path: PathBuf,
}

impl SqliteRowStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path).context("open row db")?;
        for table in Table::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    last_modified TEXT NOT NULL
                );",
                t = table.as_str()
            ))?;
        }
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }
}

fn row_modified_text(row: &Row) -> Result<String> {
    match row.get("last_modified").and_then(|v| v.as_str()) {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("row has malformed last_modified: {raw}"))?;
            Ok(parsed.with_timezone(&Utc).to_rfc3339())
        }
        None => bail!("row has no last_modified field: {row}"),
    }
}

fn upsert_row(conn: &Connection, table: Table, row: &Row) -> Result<()> {
    let id = row_id(row)?;
    let modified = row_modified_text(row)?;
    let payload = serde_json::to_string(row).context("serialize row payload")?;
    conn.execute(
        &format!(
            "INSERT INTO {t} (id, payload, last_modified) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 payload = excluded.payload,
                 last_modified = excluded.last_modified",
            t = table.as_str()
        ),
        params![id, payload, modified],
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl RowStore for SqliteRowStore {
    async fn select_modified_since(&self, table: Table, since: DateTime<Utc>) -> Result<Vec<Row>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open row db")?;
            let mut stmt = conn.prepare(&format!(
                "SELECT payload FROM {t} WHERE last_modified > ?1 ORDER BY id",
                t = table.as_str()
            ))?;
            let rows = stmt
                .query_map([since.to_rfc3339()], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|raw| serde_json::from_str(&raw).context("parse stored row"))
                .collect()
        })
        .await?
    }

    async fn upsert_all(&self, data: &TableData) -> Result<()> {
        let db_path = self.db_path.clone();
        let data = data.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path).context("open row db")?;
            let tx = conn.transaction().context("begin upsert transaction")?;
            for (table, rows) in &data {
                for row in rows {
                    upsert_row(&tx, *table, row)?;
                }
            }
            tx.commit().context("commit upsert transaction")?;
            Ok(())
        })
        .await?
    }

    async fn count(&self, table: Table) -> Result<u64> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open row db")?;
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {t}", t = table.as_str()),
                [],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
        .await?
    }

    async fn last_modified(&self, table: Table) -> Result<Option<DateTime<Utc>>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open row db")?;
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT MAX(last_modified) FROM {t} WHERE last_modified IS NOT NULL",
                        t = table.as_str()
                    ),
                    [],
                    |r| r.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten();
            match raw {
                Some(text) => {
                    let parsed = DateTime::parse_from_rfc3339(&text)
                        .with_context(|| format!("malformed last_modified in {table}: {text}"))?;
                    Ok(Some(parsed.with_timezone(&Utc)))
                }
                None => Ok(None),
            }
        })
        .await?
    }

    async fn schema_version(&self) -> Result<i64> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open row db")?;
            let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
            Ok(version)
        })
        .await?
    }
}
