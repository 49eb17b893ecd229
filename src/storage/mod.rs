//! Partitioned response storage.
//!
//! A [`CacheStorage`] holds any number of named partitions, each mapping full
//! request URLs to [`CachedResponse`]s. Writes to a single key are atomic, so
//! concurrent writers to the same partition need no further locking.

mod disk;
mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::response::CachedResponse;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

/// Abstraction over partitioned response storage.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Creates the partition if it does not exist.
    async fn open(&self, partition: &str) -> Result<()>;

    /// Returns true if the partition exists.
    async fn has(&self, partition: &str) -> Result<bool>;

    /// Deletes the partition and every entry in it. Returns false if it did
    /// not exist.
    async fn delete(&self, partition: &str) -> Result<bool>;

    /// Returns the names of all existing partitions, sorted.
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Looks up the response stored under `url`.
    async fn match_url(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>>;

    /// Stores `response` under `url`, replacing any previous entry. Creates
    /// the partition if needed.
    async fn put(&self, partition: &str, url: &str, response: CachedResponse) -> Result<()>;

    /// Removes the entry under `url`. Returns false if there was none.
    async fn remove(&self, partition: &str, url: &str) -> Result<bool>;

    /// Returns the URLs of every entry in the partition, sorted. A missing
    /// partition has no keys.
    async fn keys(&self, partition: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl<S: CacheStorage + ?Sized> CacheStorage for std::sync::Arc<S> {
    async fn open(&self, partition: &str) -> Result<()> {
        (**self).open(partition).await
    }

    async fn has(&self, partition: &str) -> Result<bool> {
        (**self).has(partition).await
    }

    async fn delete(&self, partition: &str) -> Result<bool> {
        (**self).delete(partition).await
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        (**self).partitions().await
    }

    async fn match_url(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>> {
        (**self).match_url(partition, url).await
    }

    async fn put(&self, partition: &str, url: &str, response: CachedResponse) -> Result<()> {
        (**self).put(partition, url, response).await
    }

    async fn remove(&self, partition: &str, url: &str) -> Result<bool> {
        (**self).remove(partition, url).await
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        (**self).keys(partition).await
    }
}
