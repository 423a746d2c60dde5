//! Persistent key-value store seam.
//!
//! The inventory and the audit log only ever need point reads, upserts with an optional
//! TTL, a compare-and-delete, and a prefix scan. [`MemoryStore`] backs tests and
//! embedders; [`JsonFileStore`] persists the same model to a single JSON file for the CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_by_key(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Upsert. Items written with a TTL stop being visible once it elapses.
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>)
        -> Result<()>;

    /// Delete `key` only if its current value equals `expected`. Returns whether the
    /// item was deleted.
    async fn conditional_delete(&self, key: &str, expected: &serde_json::Value) -> Result<bool>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredItem {
    value: serde_json::Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl StoredItem {
    fn new(value: serde_json::Value, ttl: Option<Duration>) -> Result<Self> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl).context("TTL out of range")?,
            ),
            None => None,
        };
        Ok(Self { value, expires_at })
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<String, StoredItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physically drop expired items. Reads already ignore them.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| item.is_live(now));
        before - items.len()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let items = self.items.read().await;
        Ok(items
            .get(key)
            .filter(|item| item.is_live(Utc::now()))
            .map(|item| item.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let item = StoredItem::new(value, ttl)?;
        self.items.write().await.insert(key.to_string(), item);
        Ok(())
    }

    async fn conditional_delete(&self, key: &str, expected: &serde_json::Value) -> Result<bool> {
        let mut items = self.items.write().await;
        match items.get(key) {
            Some(item) if item.is_live(Utc::now()) && &item.value == expected => {
                items.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let now = Utc::now();
        let items = self.items.read().await;
        let mut matches: Vec<(String, serde_json::Value)> = items
            .iter()
            .filter(|(key, item)| key.starts_with(prefix) && item.is_live(now))
            .map(|(key, item)| (key.clone(), item.value.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }
}

/// A [`KeyValueStore`] persisted to one JSON file.
///
/// The whole map is held in memory and rewritten on every mutation through a temporary
/// file and a rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    items: RwLock<HashMap<String, StoredItem>>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let items = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store file {}", path.display()))?;
            if contents.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse store file {}", path.display()))?
            }
        } else {
            HashMap::new()
        };
        debug!("Opened store {} with {} items", path.display(), items.len());
        Ok(Self {
            path,
            items: RwLock::new(items),
        })
    }

    fn flush(&self, items: &HashMap<String, StoredItem>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory {}", parent.display())
                })?;
            }
        }
        let now = Utc::now();
        let live: HashMap<&String, &StoredItem> =
            items.iter().filter(|(_, item)| item.is_live(now)).collect();
        let json = serde_json::to_string_pretty(&live).context("Failed to serialize store")?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write store file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace store file {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let items = self.items.read().await;
        Ok(items
            .get(key)
            .filter(|item| item.is_live(Utc::now()))
            .map(|item| item.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let item = StoredItem::new(value, ttl)?;
        let mut items = self.items.write().await;
        let previous = items.insert(key.to_string(), item);
        if let Err(e) = self.flush(&items) {
            // keep memory and disk in agreement
            match previous {
                Some(previous) => items.insert(key.to_string(), previous),
                None => items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn conditional_delete(&self, key: &str, expected: &serde_json::Value) -> Result<bool> {
        let mut items = self.items.write().await;
        let matches = items
            .get(key)
            .is_some_and(|item| item.is_live(Utc::now()) && &item.value == expected);
        if !matches {
            return Ok(false);
        }
        let removed = items.remove(key);
        if let Err(e) = self.flush(&items) {
            if let Some(removed) = removed {
                items.insert(key.to_string(), removed);
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let now = Utc::now();
        let items = self.items.read().await;
        let mut matches: Vec<(String, serde_json::Value)> = items
            .iter()
            .filter(|(key, item)| key.starts_with(prefix) && item.is_live(now))
            .map(|(key, item)| (key.clone(), item.value.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_and_prefix_scan() {
        let store = MemoryStore::new();
        store.put("instance#b", json!({"id": "b"}), None).await.unwrap();
        store.put("instance#a", json!({"id": "a"}), None).await.unwrap();
        store.put("audit#1", json!({"id": "1"}), None).await.unwrap();

        assert_eq!(
            store.get_by_key("instance#a").await.unwrap(),
            Some(json!({"id": "a"}))
        );
        let keys: Vec<String> = store
            .scan_prefix("instance#")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["instance#a", "instance#b"]);
    }

    #[tokio::test]
    async fn test_expired_items_are_invisible() {
        let store = MemoryStore::new();
        store
            .put("audit#old", json!(1), Some(Duration::from_secs(0)))
            .await
            .unwrap();
        store
            .put("audit#new", json!(2), Some(Duration::from_secs(3600)))
            .await
            .unwrap();

        assert_eq!(store.get_by_key("audit#old").await.unwrap(), None);
        assert_eq!(store.scan_prefix("audit#").await.unwrap().len(), 1);
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_conditional_delete_requires_match() {
        let store = MemoryStore::new();
        store.put("k", json!({"v": 1}), None).await.unwrap();

        assert!(!store.conditional_delete("k", &json!({"v": 2})).await.unwrap());
        assert!(store.get_by_key("k").await.unwrap().is_some());
        assert!(store.conditional_delete("k", &json!({"v": 1})).await.unwrap());
        assert!(store.get_by_key("k").await.unwrap().is_none());
        assert!(!store.conditional_delete("missing", &json!(null)).await.unwrap());
    }

    #[tokio::test]
    async fn test_json_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.put("instance#a", json!({"id": "a"}), None).await.unwrap();
            store.put("instance#b", json!({"id": "b"}), None).await.unwrap();
            assert!(store.conditional_delete("instance#b", &json!({"id": "b"})).await.unwrap());
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_by_key("instance#a").await.unwrap(),
            Some(json!({"id": "a"}))
        );
        assert_eq!(reopened.get_by_key("instance#b").await.unwrap(), None);
    }
}
