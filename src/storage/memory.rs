//! In-memory storage, for tests and ephemeral proxies.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::CacheStorage;
use crate::error::{Error, Result};
use crate::response::CachedResponse;

type Partitions = HashMap<String, BTreeMap<String, CachedResponse>>;

/// Storage that keeps every partition in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    partitions: Mutex<Partitions>,
}

impl MemoryStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Partitions>> {
        self.partitions
            .lock()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, partition: &str) -> Result<()> {
        self.lock()?.entry(partition.to_string()).or_default();
        Ok(())
    }

    async fn has(&self, partition: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(partition))
    }

    async fn delete(&self, partition: &str) -> Result<bool> {
        Ok(self.lock()?.remove(partition).is_some())
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn match_url(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>> {
        Ok(self
            .lock()?
            .get(partition)
            .and_then(|entries| entries.get(url))
            .cloned())
    }

    async fn put(&self, partition: &str, url: &str, mut response: CachedResponse) -> Result<()> {
        response.stored_at = Some(Utc::now());
        self.lock()?
            .entry(partition.to_string())
            .or_default()
            .insert(url.to_string(), response);
        Ok(())
    }

    async fn remove(&self, partition: &str, url: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .get_mut(partition)
            .is_some_and(|entries| entries.remove(url).is_some()))
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(partition)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_empty_partition() {
        let storage = MemoryStorage::new();
        assert!(!storage.has("content").await.unwrap());
        storage.open("content").await.unwrap();
        assert!(storage.has("content").await.unwrap());
        assert!(storage.keys("content").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_overwrites_and_stamps() {
        let storage = MemoryStorage::new();
        storage
            .put("content", "https://a/x.js", CachedResponse::new("https://a/x.js", 200, "one"))
            .await
            .unwrap();
        storage
            .put("content", "https://a/x.js", CachedResponse::new("https://a/x.js", 200, "two"))
            .await
            .unwrap();

        let hit = storage.match_url("content", "https://a/x.js").await.unwrap().unwrap();
        assert_eq!(hit.body, "two");
        assert!(hit.stored_at.is_some());
        assert_eq!(storage.keys("content").await.unwrap(), vec!["https://a/x.js"]);
    }

    #[tokio::test]
    async fn delete_drops_all_entries() {
        let storage = MemoryStorage::new();
        storage
            .put("temp", "https://a/x.js", CachedResponse::new("https://a/x.js", 200, ""))
            .await
            .unwrap();
        assert!(storage.delete("temp").await.unwrap());
        assert!(!storage.delete("temp").await.unwrap());
        assert!(storage.keys("temp").await.unwrap().is_empty());
        assert!(storage.match_url("temp", "https://a/x.js").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let storage = MemoryStorage::new();
        assert!(!storage.remove("content", "https://a/x.js").await.unwrap());
        storage
            .put("content", "https://a/x.js", CachedResponse::new("https://a/x.js", 200, ""))
            .await
            .unwrap();
        assert!(storage.remove("content", "https://a/x.js").await.unwrap());
        assert!(storage.has("content").await.unwrap());
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let storage = MemoryStorage::new();
        storage
            .put("temp", "https://a/x.js", CachedResponse::new("https://a/x.js", 200, ""))
            .await
            .unwrap();
        storage.open("content").await.unwrap();
        assert!(storage.match_url("content", "https://a/x.js").await.unwrap().is_none());
        assert_eq!(storage.partitions().await.unwrap(), vec!["content", "temp"]);
    }
}
