use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::kv::KvStore;

/// SQLite-backed durable key-value store. Each operation opens a fresh
/// connection inside `spawn_blocking` so the async runtime never blocks on
/// file I/O.
pub struct SqliteKvStore {
    db_path: PathBuf,
}

impl SqliteKvStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path).context("open kv db")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let db_path = self.db_path.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open kv db")?;
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?;
            Ok(value)
        })
        .await?
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let db_path = self.db_path.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open kv db")?;
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let db_path = self.db_path.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open kv db")?;
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
        .await?
    }
}
