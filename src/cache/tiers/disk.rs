//! Local disk tier
//!
//! One file per key under the configured directory. The filename is the SHA-256 hex
//! digest of the namespaced key, so arbitrary keys never become path components.
//! Writes go through a temporary file and a rename.

use super::CacheStore;
use crate::cache::entry::{CacheRecord, CacheTier};
use crate::errors::ResilienceResult;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const EXTENSION: &str = "cache";

/// Disk tier rooted at a directory
#[derive(Debug, Clone)]
pub struct DiskTier {
    directory: PathBuf,
}

impl DiskTier {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        debug!(directory = %directory.display(), "Disk cache tier created");
        Self { directory }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File backing `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.directory
            .join(format!("{}.{}", hex::encode(digest), EXTENSION))
    }

    async fn read_record(path: &Path) -> ResilienceResult<Option<CacheRecord>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<CacheRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable disk cache record");
                remove_file(path).await?;
                Ok(None)
            }
        }
    }

    async fn cache_files(&self) -> ResilienceResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Remove expired and unreadable files; returns how many were removed
    pub async fn purge_expired(&self) -> ResilienceResult<u64> {
        let mut removed = 0;
        for path in self.cache_files().await? {
            match Self::read_record(&path).await? {
                Some(record) if record.is_expired() => {
                    if remove_file(&path).await? {
                        removed += 1;
                    }
                }
                Some(_) => {}
                None => removed += 1,
            }
        }
        Ok(removed)
    }
}

async fn remove_file(path: &Path) -> ResilienceResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl CacheStore for DiskTier {
    fn tier(&self) -> CacheTier {
        CacheTier::Disk
    }

    async fn get(&self, key: &str) -> ResilienceResult<Option<CacheRecord>> {
        let path = self.path_for(key);
        match Self::read_record(&path).await? {
            Some(record) if record.key != key => Ok(None),
            Some(record) if record.is_expired() => {
                remove_file(&path).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(&self, record: &CacheRecord) -> ResilienceResult<()> {
        if record.is_expired() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.directory).await?;

        let path = self.path_for(&record.key);
        let staging =
            path.with_extension(format!("{}.{}.tmp", EXTENSION, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staging, serde_json::to_vec(record)?).await?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> ResilienceResult<bool> {
        remove_file(&self.path_for(key)).await
    }

    async fn clear_prefix(&self, prefix: &str) -> ResilienceResult<u64> {
        let mut removed = 0;
        for path in self.cache_files().await? {
            if let Some(record) = Self::read_record(&path).await? {
                if record.key.starts_with(prefix) && remove_file(&path).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
