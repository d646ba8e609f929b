//! Durable key-value persistence shared by the orchestrator and observers.
//!
//! Every call is a complete read-modify-write of one key; concurrent writers
//! are serialized per store and the last write wins.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{AppError, Result};

pub const BATCH_STATE_KEY: &str = "batchExportState";
pub const LAST_EXPORT_KEY: &str = "lastExportTimestamps";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

pub async fn get_typed<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| AppError::JsonParse(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

pub async fn set_typed<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value).map_err(|e| AppError::JsonSerialize(e.to_string()))?;
    store.set(key, value).await
}

/// Channel id -> epoch milliseconds of its last export.
pub type LastExports = BTreeMap<String, i64>;

pub async fn load_last_exports(store: &dyn KeyValueStore) -> Result<LastExports> {
    Ok(get_typed(store, LAST_EXPORT_KEY).await?.unwrap_or_default())
}

/// Record one channel's export time right away.
pub async fn record_last_export(store: &dyn KeyValueStore, channel_id: &str, epoch_ms: i64) -> Result<()> {
    let mut exports = load_last_exports(store).await?;
    exports.insert(channel_id.to_string(), epoch_ms);
    set_typed(store, LAST_EXPORT_KEY, &exports).await
}

/// All keys in one pretty-printed JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(AppError::ReadFile {
                    path: self.path.display().to_string(),
                    source: e,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| AppError::JsonParse(format!("{}: {}", self.path.display(), e)))
    }

    async fn write_all(&self, values: &Map<String, Value>) -> Result<()> {
        let content =
            serde_json::to_string_pretty(values).map_err(|e| AppError::JsonSerialize(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::WriteFile {
                    path: parent.display().to_string(),
                    source: e,
                })?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| AppError::WriteFile {
                path: tmp.display().to_string(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AppError::WriteFile {
                path: self.path.display().to_string(),
                source: e,
            })
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value);
        self.write_all(&values).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_some() {
            self.write_all(&values).await?;
        }
        Ok(())
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}
