use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

/// Durable key-value contract used for chunks, index, config, and the
/// rollback-point registry. Values are JSON text. No transaction spans more
/// than one key; callers order their writes accordingly.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite the value at `key`.
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Fetch and deserialize the JSON document at `key`, if present.
pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("parse stored value at key {key}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize `value` as JSON and store it at `key`.
pub async fn put_json<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let raw =
        serde_json::to_string(value).with_context(|| format!("serialize value for key {key}"))?;
    kv.put(key, raw).await
}

/// In-memory backend, used by unit tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
