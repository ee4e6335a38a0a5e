//! Key-value store implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Persistence collaborator for engine state snapshots.
///
/// Values are JSON documents; keys are flat strings scoped by the store
/// instance (one store per crawl by convention).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch and decode the value under `key`, `None` if absent.
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set_value(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error.
    async fn delete_value(&self, key: &str) -> Result<()>;
}

/// Typed helpers over the JSON surface.
///
/// Kept as extension functions so the trait stays object-safe.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get_value(key).await? {
        Some(value) => {
            let decoded = serde_json::from_value(value)
                .with_context(|| format!("malformed persisted state under key '{key}'"))?;
            Ok(Some(decoded))
        }
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let encoded = serde_json::to_value(value)
        .with_context(|| format!("failed to encode state for key '{key}'"))?;
    store.set_value(key, encoded).await
}

// =============================================================================
// File-backed store
// =============================================================================

/// One JSON file per key under `<root>/key_value_stores/<store_id>/`.
///
/// Writes go through a temp file in the same directory followed by a
/// rename, so a crash mid-write never leaves a truncated record behind.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open the store named by the recognized environment
    /// (`DRAGNET_LOCAL_STORAGE_DIR` + `DRAGNET_DEFAULT_KEY_VALUE_STORE_ID`).
    pub async fn open_default(env: &crate::config::EngineEnv) -> Result<Self> {
        let root = env.local_storage_dir.as_deref().ok_or_else(|| {
            anyhow::anyhow!("DRAGNET_LOCAL_STORAGE_DIR is not set; no local storage root")
        })?;
        Self::open(root, &env.default_key_value_store_id).await
    }

    /// Open (creating if needed) the store `store_id` under `root`.
    pub async fn open(root: &Path, store_id: &str) -> Result<Self> {
        let dir = root.join("key_value_stores").join(store_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create key-value store dir {}", dir.display()))?;
        debug!("opened file key-value store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are caller-chosen; escape path separators so a key can
        // never climb out of the store directory.
        let safe: String = key
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt state file {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn set_value(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let path = self.path_for(key);
        let json = serde_json::to_string_pretty(&value)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to commit {}", path.display()))?;
        Ok(())
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("failed to delete {}: {}", path.display(), e);
                Err(e.into())
            }
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// `DashMap`-backed store for tests and ephemeral runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValueStore {
    values: Arc<DashMap<String, serde_json::Value>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, for test assertions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set_value(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}
