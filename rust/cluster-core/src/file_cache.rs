// rust/cluster-core/src/file_cache.rs

//! Checksum-gated file distribution cache.
//!
//! The master remembers, per worker and base file name, the checksum and
//! modification time of the last version it made available to that worker.
//! [`Coordinator::check_file`] uses the table to decide whether a file has to
//! be physically transferred.
//!
//! An unchanged modification time is trusted without rehashing the file.
//! A touch that leaves the content alone costs one rehash; a content change
//! that keeps the modification time is not detected.

use std::collections::HashMap;
use std::hash::Hasher;
use std::path::Path;
use std::time::SystemTime;

use tokio::io::AsyncReadExt;
use tracing::debug;
use twox_hash::XxHash64;

use crate::config::Role;
use crate::engine::Coordinator;
use crate::error::{ClusterError, Result};
use crate::protocol::{Checksum, Message};
use crate::registry::WorkerId;

const HASH_BLOCK: usize = 64 * 1024;

/// What the master last made available to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub checksum: Checksum,
    pub modified: SystemTime,
}

/// Table keyed by `"<host>:<ordinal>:<basename>"`.
#[derive(Debug, Default)]
pub struct FileCache {
    entries: HashMap<String, CacheEntry>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CacheEntry)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }

    /// Entries are only ever dropped all at once, together with the remote
    /// caches.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// xxHash64 of `data`.
pub fn content_checksum(data: &[u8]) -> Checksum {
    let mut hasher = XxHash64::default();
    hasher.write(data);
    hasher.finish()
}

/// xxHash64 of a file's content, read in blocks.
pub async fn file_checksum(path: &Path) -> Result<Checksum> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ClusterError::io_with_source(path, "failed to open file", e))?;
    let mut hasher = XxHash64::default();
    let mut block = vec![0u8; HASH_BLOCK];
    loop {
        let n = file
            .read(&mut block)
            .await
            .map_err(|e| ClusterError::io_with_source(path, "failed to read file", e))?;
        if n == 0 {
            break;
        }
        hasher.write(&block[..n]);
    }
    Ok(hasher.finish())
}

/// Size and modification time of a regular, non-empty file.
pub(crate) async fn stat_file(path: &Path) -> Result<(u64, SystemTime)> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ClusterError::io_with_source(path, "cannot stat file", e))?;
    if !meta.is_file() {
        return Err(ClusterError::io(path, "not a regular file"));
    }
    if meta.len() == 0 {
        return Err(ClusterError::io(path, "empty file"));
    }
    let modified = meta
        .modified()
        .map_err(|e| ClusterError::io_with_source(path, "no modification time", e))?;
    Ok((meta.len(), modified))
}

pub(crate) fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ClusterError::io(path, "path has no file name"))
}

/// Outcome of checking one file against one worker.
#[derive(Debug)]
pub(crate) struct FileCheck {
    /// Bytes to send; zero when the worker already holds the content.
    pub size: u64,
    /// Entry to record once the worker has received the file.
    pub pending: Option<(String, CacheEntry)>,
}

impl Coordinator {
    /// Number of bytes of `path` that have to be sent to worker `id`: zero
    /// when the worker already holds this content, else the file size.
    ///
    /// The table only learns about content the worker confirmed. A file that
    /// still has to be sent is checked again in full next time.
    pub async fn check_file(&mut self, path: &Path, id: WorkerId) -> Result<u64> {
        Ok(self.inspect_file(path, id).await?.size)
    }

    pub(crate) async fn inspect_file(&mut self, path: &Path, id: WorkerId) -> Result<FileCheck> {
        let (size, modified) = stat_file(path).await?;
        let name = base_name(path)?;
        let info = self
            .worker_info(id)
            .ok_or_else(|| ClusterError::protocol(format!("unknown worker {}", id)))?;
        let key = info.cache_key(&name);
        let cached = self.file_cache.get(&key).copied();

        if cached.is_some_and(|c| c.modified == modified) {
            return Ok(FileCheck { size: 0, pending: None });
        }

        let entry = CacheEntry {
            checksum: file_checksum(path).await?,
            modified,
        };
        let probe = match cached {
            None => true,
            Some(c) if c.checksum == entry.checksum => {
                debug!("{} touched but unchanged for worker {}", name, id);
                self.file_cache.insert(key, entry);
                return Ok(FileCheck { size: 0, pending: None });
            }
            // Workers of a master may share filesystems and caches
            Some(_) => self.config.session.role == Role::Delegating,
        };

        if probe && self.probe_remote(id, &name, entry.checksum).await? {
            self.file_cache.insert(key, entry);
            return Ok(FileCheck { size: 0, pending: None });
        }
        Ok(FileCheck {
            size,
            pending: Some((key, entry)),
        })
    }

    /// Asks worker `id` whether it holds `name` with `checksum`. A confirming
    /// worker installs its copy in place.
    pub(crate) async fn probe_remote(
        &mut self,
        id: WorkerId,
        name: &str,
        checksum: Checksum,
    ) -> Result<bool> {
        let probe = Message::CheckFile {
            name: name.to_string(),
            checksum,
        };
        self.send_to(id, &probe).await?;
        loop {
            match self.recv_from(id).await? {
                Message::Ping => continue,
                Message::CheckFile { .. } => return Ok(true),
                Message::NotOk => return Ok(false),
                other => {
                    return Err(ClusterError::protocol(format!(
                        "unexpected {} in reply to check-file '{}'",
                        other.tag(),
                        name
                    )))
                }
            }
        }
    }
}
