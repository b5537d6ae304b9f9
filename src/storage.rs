//! Keyed blob storage
//!
//! The persistence contract for the coordination core: an abstract store of
//! opaque JSON documents under `<entity>:<id>` keys, with an in-memory
//! variant for tests and single-process deployments and a file-backed
//! variant for durable setups. Keys are filesystem-safe strings; the file
//! backend escapes slashes before touching the filesystem.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Abstract keyed blob store
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetches the document stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value` under `key`, replacing any prior document
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Removes `key`; returns whether a document was present
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a document exists under `key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, in unspecified order
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory storage backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: DashMap<String, Value>,
}

impl MemoryStorage {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every stored document
    pub fn clear(&self) {
        self.data.clear();
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

/// File-backed storage: one pretty-printed JSON document per key
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    /// Opens (and creates, if needed) the storage directory
    ///
    /// # Errors
    ///
    /// Returns a transient error when the directory cannot be created.
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", escape_key(key)))
    }
}

// Reversible escaping: '%' first, then the separators a key may carry.
fn escape_key(key: &str) -> String {
    key.replace('%', "%25")
        .replace('/', "%2F")
        .replace('\\', "%5C")
}

fn unescape_key(escaped: &str) -> String {
    escaped
        .replace("%5C", "\\")
        .replace("%2F", "/")
        .replace("%25", "%")
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key);
        let bytes = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&path, bytes).await?;
        debug!(key, path = %path.display(), "stored document");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let key = unescape_key(stem);
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
