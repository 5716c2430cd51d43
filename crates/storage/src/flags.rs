use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::kv::{get_json, put_json, KvStore};

const FLAGS_KEY: &str = "feature_flags";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Contract to the host application's feature-flag collection.
#[async_trait::async_trait]
pub trait FlagStore: Send + Sync {
    async fn all_flags(&self) -> Result<Vec<FeatureFlag>>;

    async fn get_flag(&self, key: &str) -> Result<Option<FeatureFlag>>;

    /// Flip a flag, creating it when absent. Reapplying a rollback point's
    /// flag snapshot must succeed even for flags deleted since the point was
    /// taken.
    async fn set_enabled(&self, key: &str, enabled: bool) -> Result<()>;
}

/// Flag collection stored as one JSON document in the durable store.
pub struct KvFlagStore {
    kv: Arc<dyn KvStore>,
}

impl KvFlagStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn load(&self) -> Result<Vec<FeatureFlag>> {
        Ok(get_json(self.kv.as_ref(), FLAGS_KEY)
            .await?
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl FlagStore for KvFlagStore {
    async fn all_flags(&self) -> Result<Vec<FeatureFlag>> {
        self.load().await
    }

    async fn get_flag(&self, key: &str) -> Result<Option<FeatureFlag>> {
        Ok(self.load().await?.into_iter().find(|f| f.key == key))
    }

    async fn set_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        let mut flags = self.load().await?;
        match flags.iter_mut().find(|f| f.key == key) {
            Some(flag) => flag.enabled = enabled,
            None => flags.push(FeatureFlag {
                key: key.to_owned(),
                enabled,
                description: None,
            }),
        }
        put_json(self.kv.as_ref(), FLAGS_KEY, &flags).await
    }
}
