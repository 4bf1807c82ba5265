// rust/cluster-core/src/transfer.rs

//! Shipping files to the active workers and managing their file caches.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::Role;
use crate::connection::send_raw_all;
use crate::engine::Coordinator;
use crate::error::{ClusterError, Result};
use crate::file_cache::{base_name, stat_file, FileCheck};
use crate::protocol::{CacheOp, InterruptKind, Message};
use crate::registry::{Scope, WorkerId};

impl Coordinator {
    /// Send `path` to every active worker that does not hold its current
    /// content. Returns the number of workers that received the file.
    ///
    /// A worker that fails mid-transfer is marked bad and the others still
    /// get the file. A local read error interrupts the active workers and is
    /// returned.
    pub async fn send_file(&mut self, path: &Path, binary: bool) -> Result<usize> {
        stat_file(path).await?;
        let name = base_name(path)?;
        let delegating = self.config.session.role == Role::Delegating;
        let mut sent = 0;

        for id in self.registry.ids(Scope::Active) {
            let FileCheck { size, pending } = match self.inspect_file(path, id).await {
                Ok(check) => check,
                Err(e) if e.is_connection_failure() => {
                    self.mark_bad(id, &e);
                    continue;
                }
                Err(e) => {
                    warn!("Cannot check {} on worker {}: {}", name, id, e);
                    continue;
                }
            };
            // A remote master still gets the announcement so it can serve
            // workers it adds later
            if delegating && size == 0 {
                debug!("Worker {} already holds {}", id, name);
                continue;
            }

            let announce = Message::SendFile {
                name: name.clone(),
                binary,
                size,
            };
            if let Err(e) = self.send_to(id, &announce).await {
                self.mark_bad(id, &e);
                continue;
            }
            if size == 0 {
                continue;
            }

            match self.stream_file(id, path, size).await {
                Ok(()) => {
                    if let Some((key, entry)) = pending {
                        self.file_cache.insert(key, entry);
                    }
                    sent += 1;
                }
                Err(e) if e.is_connection_failure() => self.mark_bad(id, &e),
                Err(e) => {
                    self.interrupt(InterruptKind::Soft, Scope::Active).await;
                    return Err(e);
                }
            }
        }

        if sent > 0 {
            info!("Sent {} to {} workers", name, sent);
        }
        Ok(sent)
    }

    async fn stream_file(&mut self, id: WorkerId, path: &Path, size: u64) -> Result<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ClusterError::io_with_source(path, "failed to open file", e))?;
        let mut block = vec![0u8; self.config.transfer.file_block_size];
        let mut remaining = size;

        while remaining > 0 {
            let want = block.len().min(remaining as usize);
            let n = file
                .read(&mut block[..want])
                .await
                .map_err(|e| ClusterError::io_with_source(path, "failed to read file", e))?;
            if n == 0 {
                return Err(ClusterError::io(path, "file shrank during transfer"));
            }
            send_raw_all(self.connection(id)?, &block[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Run a cache sub-command on the workers of `scope` and return the
    /// round status.
    pub(crate) async fn cache_op(&mut self, op: CacheOp, scope: Scope) -> i32 {
        let ids = self.registry.ids(scope);
        self.broadcast(&Message::Cache(op), &ids).await;
        self.collect_workers(&ids).await;
        self.status()
    }

    /// List the file caches; with `all`, every worker lists its own.
    pub async fn show_cache(&mut self, all: bool) -> i32 {
        self.cache_op(CacheOp::ShowCache { all }, Scope::Unique).await
    }

    /// Empty the remote file caches and forget what was sent, so every file
    /// goes out again.
    pub async fn clear_cache(&mut self) -> i32 {
        let status = self.cache_op(CacheOp::ClearCache, Scope::Unique).await;
        self.file_cache.clear();
        status
    }
}
