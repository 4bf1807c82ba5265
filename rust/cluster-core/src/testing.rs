// rust/cluster-core/src/testing.rs

//! Scripted fake workers on the in-memory transport.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::{ClusterConfig, WorkerEntry};
use crate::connection::{recv_raw_exact, send_raw_all, Connection, Connector, RawFlag, RawRead};
use crate::engine::Coordinator;
use crate::error::{ClusterError, Result};
use crate::file_cache::content_checksum;
use crate::protocol::{CacheOp, Checksum, InterruptKind, Message, StatusReport};
use crate::registry::{WorkerId, WorkerInfo};
use crate::sink::BulkTransfer;
use crate::transport::{pair, MemoryConnection};

/// A coordinator with `n` registered, inactive workers `w0..wn`, plus the
/// worker ends of their connections.
pub(crate) fn coordinator_with(n: usize) -> (Coordinator, Vec<MemoryConnection>) {
    coordinator_with_config(ClusterConfig::default(), n)
}

pub(crate) fn coordinator_with_config(
    config: ClusterConfig,
    n: usize,
) -> (Coordinator, Vec<MemoryConnection>) {
    let mut coord = Coordinator::new(config);
    let mut peers = Vec::with_capacity(n);
    for i in 0..n {
        let entry = WorkerEntry::new(format!("w{}", i));
        let (master_end, worker_end) = pair(entry.host.clone());
        coord.add_worker(WorkerInfo::new(i as WorkerId, &entry), Box::new(master_end));
        peers.push(worker_end);
    }
    (coord, peers)
}

/// Files and packages visible to the workers that share it.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedDisk {
    inner: Arc<Mutex<DiskState>>,
}

#[derive(Debug, Default)]
struct DiskState {
    files: HashMap<String, Checksum>,
    packages: HashMap<String, Checksum>,
    locked: HashSet<String>,
    transfers: Vec<(String, String, u64)>,
    cache_ops: Vec<(String, CacheOp)>,
}

impl SharedDisk {
    fn with<R>(&self, f: impl FnOnce(&mut DiskState) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn put(&self, name: &str, checksum: Checksum) {
        self.with(|d| d.files.insert(name.to_string(), checksum));
    }

    pub(crate) fn install_package(&self, name: &str, checksum: Checksum) {
        self.with(|d| d.packages.insert(name.to_string(), checksum));
    }

    pub(crate) fn has_package(&self, name: &str) -> bool {
        self.with(|d| d.packages.contains_key(name))
    }

    /// Physical file transfers as (host, name, bytes).
    pub(crate) fn transfers(&self) -> Vec<(String, String, u64)> {
        self.with(|d| d.transfers.clone())
    }

    pub(crate) fn cache_ops(&self) -> Vec<(String, CacheOp)> {
        self.with(|d| d.cache_ops.clone())
    }
}

/// How a fake worker answers.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerScript {
    vanish: bool,
    stuck: bool,
    command_replies: Vec<Message>,
    log: Vec<u8>,
    exit_status: i32,
    status: StatusReport,
    build_status: i32,
    unpack_fails: bool,
}

impl WorkerScript {
    /// Close the connection before answering anything.
    pub(crate) fn vanish(mut self) -> Self {
        self.vanish = true;
        self
    }

    /// Messages sent in reply to a command, before log-done. A log-chunk is
    /// followed by that many bytes of the script's log; a fatal error ends
    /// the round without log-done.
    pub(crate) fn on_command(mut self, replies: Vec<Message>) -> Self {
        self.command_replies = replies;
        self
    }

    pub(crate) fn with_log(mut self, log: Vec<u8>) -> Self {
        self.log = log;
        self
    }

    pub(crate) fn exit_status(mut self, status: i32) -> Self {
        self.exit_status = status;
        self
    }

    pub(crate) fn status(mut self, report: StatusReport) -> Self {
        self.status = report;
        self
    }

    /// On a command, write the script's log without waiting for the master
    /// and then only watch the out-of-band channel.
    pub(crate) fn stuck(mut self) -> Self {
        self.stuck = true;
        self
    }

    pub(crate) fn build_status(mut self, status: i32) -> Self {
        self.build_status = status;
        self
    }

    pub(crate) fn unpack_fails(mut self) -> Self {
        self.unpack_fails = true;
        self
    }
}

pub(crate) struct FakeWorker {
    host: String,
    image: String,
    perf: u32,
    script: WorkerScript,
    disk: SharedDisk,
}

impl FakeWorker {
    pub(crate) fn new(host: impl Into<String>, script: WorkerScript) -> Self {
        Self {
            host: host.into(),
            image: String::new(),
            perf: crate::config::DEFAULT_PERF,
            script,
            disk: SharedDisk::default(),
        }
    }

    pub(crate) fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub(crate) fn perf(mut self, perf: u32) -> Self {
        self.perf = perf;
        self
    }

    pub(crate) fn disk(mut self, disk: SharedDisk) -> Self {
        self.disk = disk;
        self
    }

    fn entry(&self) -> WorkerEntry {
        WorkerEntry {
            perf: self.perf,
            image: self.image.clone(),
            ..WorkerEntry::new(self.host.clone())
        }
    }

    async fn run(self, mut conn: MemoryConnection) {
        if self.script.vanish {
            return;
        }
        loop {
            let Ok(message) = conn.recv().await else {
                return;
            };
            match self.handle(&mut conn, message).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return,
            }
        }
    }

    async fn done(&self, conn: &mut MemoryConnection, status: i32, parallel: u32) -> Result<()> {
        conn.send(&Message::LogDone { status, parallel }).await
    }

    /// Returns false when the worker should exit.
    async fn handle(&self, conn: &mut MemoryConnection, message: Message) -> Result<bool> {
        match message {
            Message::Command(_) if self.script.stuck => return self.spin(conn).await,
            Message::Command(_) => {
                for reply in &self.script.command_replies {
                    conn.send(reply).await?;
                    match reply {
                        Message::LogChunk { size } => {
                            send_raw_all(conn, &self.script.log[..*size as usize]).await?;
                        }
                        Message::Fatal => return Ok(true),
                        _ => {}
                    }
                }
                self.done(conn, self.script.exit_status, 1).await?;
            }
            Message::Status => {
                conn.send(&Message::StatusReport(self.script.status.clone()))
                    .await?;
            }
            Message::Reset(_) | Message::Object(_) => self.done(conn, 0, 1).await?,
            Message::ParallelSetup { count, .. } => self.done(conn, 0, count).await?,
            Message::CheckFile { name, checksum } => {
                let confirmed = self.check(&name, checksum);
                let reply = if confirmed {
                    Message::CheckFile { name, checksum }
                } else {
                    Message::NotOk
                };
                conn.send(&reply).await?;
            }
            Message::SendFile { name, size, .. } => {
                let mut content = vec![0u8; size as usize];
                recv_raw_exact(conn, &mut content).await?;
                let checksum = content_checksum(&content);
                let host = self.host.clone();
                self.disk.with(|d| {
                    d.files.insert(name.clone(), checksum);
                    d.transfers.push((host, name, size));
                });
            }
            Message::Cache(op) => {
                let status = match &op {
                    CacheOp::BuildPackage(_) => self.script.build_status,
                    CacheOp::ClearCache => {
                        self.disk.with(|d| d.files.clear());
                        0
                    }
                    CacheOp::ClearPackage(name) => {
                        let name = format!("{}.par", name);
                        self.disk.with(|d| d.packages.remove(&name));
                        0
                    }
                    CacheOp::ClearPackages => {
                        self.disk.with(|d| d.packages.clear());
                        0
                    }
                    _ => 0,
                };
                let host = self.host.clone();
                self.disk.with(|d| d.cache_ops.push((host, op)));
                self.done(conn, status, 1).await?;
            }
            // Fire-and-forget messages
            _ => {}
        }
        Ok(true)
    }

    /// `+name` locks a package unless it is installed, `-name` unpacks and
    /// unlocks it; bare names probe the file cache.
    fn check(&self, name: &str, checksum: Checksum) -> bool {
        if let Some(package) = name.strip_prefix('+') {
            return self.disk.with(|d| {
                if d.packages.get(package) == Some(&checksum) {
                    true
                } else {
                    d.locked.insert(package.to_string());
                    false
                }
            });
        }
        if let Some(package) = name.strip_prefix('-') {
            let ok = !self.script.unpack_fails;
            return self.disk.with(|d| {
                d.locked.remove(package);
                if ok {
                    d.packages.insert(package.to_string(), checksum);
                }
                ok
            });
        }
        self.disk.with(|d| d.files.get(name) == Some(&checksum))
    }

    /// A worker busy in a long computation: its output piles up unread and
    /// only the out-of-band channel is polled.
    async fn spin(&self, conn: &mut MemoryConnection) -> Result<bool> {
        if !self.script.log.is_empty() {
            let size = self.script.log.len() as u64;
            conn.send(&Message::LogChunk { size }).await?;
            send_raw_all(conn, &self.script.log).await?;
        }

        let mut byte = [0u8; 1];
        loop {
            match conn.recv_raw(&mut byte, RawFlag::OutOfBand).await? {
                RawRead::Bytes(1) => break,
                _ => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }

        match InterruptKind::from_byte(byte[0]) {
            Some(InterruptKind::Hard) => {
                conn.send_raw(&byte, RawFlag::OutOfBand).await?;
                self.done(conn, self.script.exit_status, 1).await?;
                Ok(true)
            }
            Some(InterruptKind::Soft) => {
                self.done(conn, self.script.exit_status, 1).await?;
                Ok(true)
            }
            Some(InterruptKind::Shutdown) | None => Ok(false),
        }
    }
}

/// Spawns `fake` on the worker end of a fresh in-memory pair.
pub(crate) fn spawn_worker(
    ordinal: WorkerId,
    fake: FakeWorker,
) -> (WorkerInfo, Box<dyn Connection>, JoinHandle<()>) {
    let info = WorkerInfo::new(ordinal, &fake.entry());
    let (master_end, worker_end) = pair(fake.host.clone());
    let handle = tokio::spawn(fake.run(worker_end));
    (info, Box::new(master_end), handle)
}

/// Connects roster entries to default fake workers; `unreachable` hosts are
/// refused.
#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    pub(crate) unreachable: HashSet<String>,
    pub(crate) disk: SharedDisk,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, entry: &WorkerEntry) -> Result<Box<dyn Connection>> {
        if self.unreachable.contains(&entry.host) {
            return Err(ClusterError::connection(format!(
                "connection to {}:{} refused",
                entry.host, entry.port
            )));
        }
        let fake = FakeWorker::new(entry.host.clone(), WorkerScript::default())
            .image(entry.image.clone())
            .perf(entry.perf)
            .disk(self.disk.clone());
        let (master_end, worker_end) = pair(entry.host.clone());
        tokio::spawn(fake.run(worker_end));
        Ok(Box::new(master_end))
    }
}

/// One recorded bulk upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BulkPut {
    pub(crate) host: String,
    pub(crate) remote_path: String,
    pub(crate) streams: u32,
    pub(crate) bytes: u64,
}

/// Bulk channel that records uploads instead of opening sockets.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingBulk {
    puts: Arc<Mutex<Vec<BulkPut>>>,
    pub(crate) failing_hosts: HashSet<String>,
}

impl RecordingBulk {
    pub(crate) fn puts(&self) -> Vec<BulkPut> {
        self.puts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl BulkTransfer for RecordingBulk {
    async fn put(
        &mut self,
        target: &WorkerInfo,
        source: &Path,
        remote_path: &str,
        streams: u32,
    ) -> Result<u64> {
        if self.failing_hosts.contains(&target.host) {
            return Err(ClusterError::connection(format!(
                "bulk transfer to {} refused",
                target.host
            )));
        }
        let bytes = std::fs::metadata(source)
            .map_err(|e| ClusterError::io_with_source(source, "failed to stat file", e))?
            .len();
        self.puts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BulkPut {
                host: target.host.clone(),
                remote_path: remote_path.to_string(),
                streams,
                bytes,
            });
        Ok(bytes)
    }
}
