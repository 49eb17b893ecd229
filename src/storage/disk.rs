//! On-disk storage using `tokio::fs`.
//!
//! Layout: `{root}/{partition}/{sha256(url)}.json` is the entry record: the
//! response metadata (including the URL itself) and the name of its body
//! file, `{sha256(url)}.{uuid}.body`. Every put writes a body file under a
//! fresh name, then renames a new record into place. That rename is the only
//! commit point, so a record always names the body written with it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::CacheStorage;
use crate::error::{Error, Result};
use crate::response::{CachedResponse, ResponseMetadata};

const META_EXT: &str = "json";
const BODY_EXT: &str = "body";

/// What the `.json` file of an entry holds.
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    #[serde(flatten)]
    metadata: ResponseMetadata,
    /// File name of the body, in the same directory.
    body: String,
}

/// Storage rooted at a directory, one subdirectory per partition.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Creates storage rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: &str) -> Result<PathBuf> {
        let valid = !partition.is_empty()
            && !partition.starts_with('.')
            && partition
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(Error::Storage(format!(
                "invalid partition name {partition:?}"
            )));
        }
        Ok(self.root.join(partition))
    }

    /// Returns the partition directory and the record path for `url`.
    fn record_path(&self, partition: &str, url: &str) -> Result<(PathBuf, PathBuf)> {
        let dir = self.partition_dir(partition)?;
        let record = dir.join(format!("{}.{META_EXT}", entry_stem(url)));
        Ok((dir, record))
    }

    async fn read_record(path: &Path) -> Result<Option<EntryRecord>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolves a record's body file, refusing names that leave `dir`.
fn body_path(dir: &Path, record: &EntryRecord) -> Result<PathBuf> {
    let name = Path::new(&record.body);
    if name.file_name() != Some(name.as_os_str()) {
        return Err(Error::Storage(format!(
            "entry {} names invalid body file {:?}",
            record.metadata.url, record.body
        )));
    }
    Ok(dir.join(name))
}

/// File stem for an entry: the hex SHA-256 of its URL.
fn entry_stem(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// Writes `contents` next to `path` and renames it into place.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Removes a file, treating "already gone" as success. Returns whether it
/// existed.
async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, partition: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.partition_dir(partition)?).await?;
        Ok(())
    }

    async fn has(&self, partition: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.partition_dir(partition)?)
            .await
            .is_ok_and(|m| m.is_dir()))
    }

    async fn delete(&self, partition: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.partition_dir(partition)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn match_url(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>> {
        let (dir, record_path) = self.record_path(partition, url)?;
        let Some(record) = Self::read_record(&record_path).await? else {
            return Ok(None);
        };
        let body = match tokio::fs::read(body_path(&dir, &record)?).await {
            Ok(body) => Bytes::from(body),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!("Cache entry {url} in {partition} has no body, ignoring");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(CachedResponse::from_parts(record.metadata, body)))
    }

    async fn put(&self, partition: &str, url: &str, response: CachedResponse) -> Result<()> {
        self.open(partition).await?;
        let (dir, record_path) = self.record_path(partition, url)?;
        let previous = Self::read_record(&record_path).await.ok().flatten();

        let mut metadata = response.metadata();
        // Stored under the request URL, whatever URL the response came from.
        metadata.url = url.to_string();
        metadata.stored_at = Some(Utc::now());
        let record = EntryRecord {
            metadata,
            body: format!("{}.{}.{BODY_EXT}", entry_stem(url), Uuid::new_v4().simple()),
        };

        let body = dir.join(&record.body);
        tokio::fs::write(&body, &response.body).await?;
        if let Err(e) = write_atomic(&record_path, &serde_json::to_vec(&record)?).await {
            let _ = tokio::fs::remove_file(&body).await;
            return Err(e.into());
        }

        // A put racing on the same URL can leave its body behind; deleting
        // the partition clears those.
        if let Some(previous) = previous
            && let Ok(stale) = body_path(&dir, &previous)
        {
            remove_if_exists(&stale).await?;
        }
        Ok(())
    }

    async fn remove(&self, partition: &str, url: &str) -> Result<bool> {
        let (dir, record_path) = self.record_path(partition, url)?;
        let Some(record) = Self::read_record(&record_path).await? else {
            return Ok(false);
        };
        let existed = remove_if_exists(&record_path).await?;
        remove_if_exists(&body_path(&dir, &record)?).await?;
        Ok(existed)
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        let dir = self.partition_dir(partition)?;
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut urls = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == META_EXT)
                && let Some(record) = Self::read_record(&path).await?
            {
                urls.push(record.metadata.url);
            }
        }
        urls.sort();
        Ok(urls)
    }
}
