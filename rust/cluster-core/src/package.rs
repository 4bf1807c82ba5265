// rust/cluster-core/src/package.rs

//! Package lifecycle: upload, build, load.
//!
//! A package is a `.par` archive. Uploads are gated per filesystem image by
//! a remote lock: a `check-file("+name")` probe locks the package directory
//! unless the installed copy already matches, and `check-file("-name")`
//! unpacks the uploaded archive and releases the lock.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::config::Role;
use crate::engine::Coordinator;
use crate::error::{ClusterError, Result};
use crate::file_cache::{base_name, file_checksum};
use crate::protocol::{CacheOp, Checksum};
use crate::registry::{Scope, WorkerId};

const PACKAGE_EXTENSION: &str = ".par";

/// Outcome of [`Coordinator::upload_package`].
#[derive(Debug, Default)]
pub struct UploadReport {
    /// Workers that received and unpacked the archive.
    pub uploaded: Vec<WorkerId>,
    /// Workers whose installed copy already matched.
    pub skipped: Vec<WorkerId>,
    pub failed: Vec<(WorkerId, ClusterError)>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Upload<'a> {
    source: &'a Path,
    archive: &'a str,
    checksum: Checksum,
    remote_path: String,
    streams: u32,
}

/// Package name for a name or a `.par` path: directories and the extension
/// are stripped.
pub fn package_name(package: &str) -> Result<String> {
    let trimmed = package.trim();
    let stem = trimmed.strip_suffix(PACKAGE_EXTENSION).unwrap_or(trimmed);
    let name = Path::new(stem)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(ClusterError::package(package, "a package name is required"));
    }
    Ok(name.to_string())
}

impl Coordinator {
    /// Remote location of an uploaded archive.
    fn package_path(&self, archive: &str) -> String {
        let session = &self.config.session;
        let dir = PathBuf::from(&session.work_dir).join(&session.package_dir);
        format!("{}/{}", dir.display(), archive)
    }

    /// Upload the `.par` archive at `path` to one worker per filesystem
    /// image, over up to `streams` parallel streams.
    ///
    /// Fails without contacting any worker if the path is not a readable
    /// `.par` file.
    pub async fn upload_package(&mut self, path: &Path, streams: u32) -> Result<UploadReport> {
        let archive = base_name(path)?;
        if !archive.ends_with(PACKAGE_EXTENSION) {
            return Err(ClusterError::package(
                archive,
                format!("must have extension {}", PACKAGE_EXTENSION),
            ));
        }
        let upload = Upload {
            source: path,
            checksum: file_checksum(path).await?,
            remote_path: self.package_path(&archive),
            // Workers of a master are on its LAN
            streams: match self.config.session.role {
                Role::Delegating => 1,
                Role::Direct => streams.max(1),
            },
            archive: &archive,
        };

        let mut report = UploadReport::default();
        for id in self.registry.ids(Scope::Unique) {
            match self.upload_to(id, &upload).await {
                Ok(true) => report.uploaded.push(id),
                Ok(false) => {
                    debug!("Worker {} already has {}", id, archive);
                    report.skipped.push(id);
                }
                Err(e) => {
                    error!("Upload of {} to worker {} failed: {}", archive, id, e);
                    if e.is_connection_failure() {
                        self.mark_bad(id, &e);
                    }
                    report.failed.push((id, e));
                }
            }
        }
        info!(
            "Package {}: {} uploaded, {} up to date, {} failed",
            archive,
            report.uploaded.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Returns false when the worker's installed copy already matched.
    async fn upload_to(&mut self, id: WorkerId, upload: &Upload<'_>) -> Result<bool> {
        let lock = format!("+{}", upload.archive);
        if self.probe_remote(id, &lock, upload.checksum).await? {
            return Ok(false);
        }

        let info = self
            .worker_info(id)
            .ok_or_else(|| ClusterError::protocol(format!("unknown worker {}", id)))?;
        let sent = self
            .bulk
            .put(&info, upload.source, &upload.remote_path, upload.streams)
            .await?;
        debug!("Sent {} bytes of {} to {}", sent, upload.archive, info.host);

        let unpack = format!("-{}", upload.archive);
        if !self.probe_remote(id, &unpack, upload.checksum).await? {
            return Err(ClusterError::resource(
                id,
                format!("unpacking {} failed", upload.archive),
            ));
        }
        Ok(true)
    }

    /// Build `package` once per filesystem image. Returns the round status.
    pub async fn build_package(&mut self, package: &str) -> Result<i32> {
        let name = package_name(package)?;
        Ok(self.cache_op(CacheOp::BuildPackage(name), Scope::Unique).await)
    }

    /// Load `package` into every active worker. Returns the round status.
    pub async fn load_package(&mut self, package: &str) -> Result<i32> {
        let name = package_name(package)?;
        Ok(self.cache_op(CacheOp::LoadPackage(name), Scope::Active).await)
    }

    /// Build then load `package`, stopping at the first failing step.
    pub async fn enable_package(&mut self, package: &str) -> Result<()> {
        let name = package_name(package)?;
        let status = self.build_package(&name).await?;
        if status != 0 {
            return Err(ClusterError::package(name, format!("build failed with status {}", status)));
        }
        let status = self.load_package(&name).await?;
        if status != 0 {
            return Err(ClusterError::package(name, format!("load failed with status {}", status)));
        }
        Ok(())
    }

    pub async fn clear_package(&mut self, package: &str) -> Result<i32> {
        let name = package_name(package)?;
        Ok(self.cache_op(CacheOp::ClearPackage(name), Scope::Unique).await)
    }

    pub async fn clear_packages(&mut self) -> i32 {
        self.cache_op(CacheOp::ClearPackages, Scope::Unique).await
    }

    pub async fn show_packages(&mut self, all: bool) -> i32 {
        self.cache_op(CacheOp::ShowPackages { all }, Scope::Unique).await
    }

    /// Enabled packages differ per process, so every active worker answers.
    pub async fn show_enabled_packages(&mut self, all: bool) -> i32 {
        let status = self
            .cache_op(CacheOp::ShowEnabledPackages { all }, Scope::Active)
            .await;
        if status != 0 {
            warn!("Listing enabled packages returned status {}", status);
        }
        status
    }
}
