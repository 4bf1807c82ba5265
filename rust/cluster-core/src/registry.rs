// rust/cluster-core/src/registry.rs

//! The worker table.
//!
//! One authoritative, rank-sorted table holds every worker of the session.
//! The *all*, *active*, *unique* and *bad* views are derived from each
//! worker's [`WorkerStatus`] and `unique` flag whenever they are asked for.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::WorkerEntry;
use crate::connection::Connection;
use crate::error::{ClusterError, Result};
use crate::protocol::StatusReport;

/// Session-local ordinal of a worker.
pub type WorkerId = u32;

/// Identity of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub ordinal: WorkerId,
    pub host: String,
    pub port: u16,
    /// Performance rank; higher ranks are activated first.
    pub perf: u32,
    /// Filesystem image tag.
    pub image: String,
    /// Identifies this connection in logs and summaries.
    pub session_token: String,
}

impl WorkerInfo {
    pub fn new(ordinal: WorkerId, entry: &WorkerEntry) -> Self {
        Self {
            ordinal,
            host: entry.host.clone(),
            port: entry.port,
            perf: entry.perf,
            image: entry.image_tag().to_string(),
            session_token: Uuid::new_v4().to_string(),
        }
    }

    /// Key prefix of this worker's file-cache entries.
    pub fn cache_key(&self, basename: &str) -> String {
        format!("{}:{}:{}", self.host, self.ordinal, basename)
    }
}

/// Statistics reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkerStats {
    pub bytes_read: u64,
    pub real_time: f64,
    pub cpu_time: f64,
}

impl WorkerStats {
    pub fn record(&mut self, report: &StatusReport) {
        self.bytes_read = report.bytes_read;
        self.real_time = report.real_time;
        self.cpu_time = report.cpu_time;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Active,
    Inactive,
    Bad,
}

/// Which workers an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every valid worker.
    All,
    Active,
    /// One active worker per distinct filesystem image.
    Unique,
}

/// Worker state tracked by the registry.
pub struct Worker {
    info: WorkerInfo,
    conn: Option<Box<dyn Connection>>,
    stats: WorkerStats,
    work_dir: Option<String>,
    status: WorkerStatus,
    unique: bool,
    connected_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl Worker {
    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn ordinal(&self) -> WorkerId {
        self.info.ordinal
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status != WorkerStatus::Bad
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Working directory from the last status report.
    pub fn work_dir(&self) -> Option<&str> {
        self.work_dir.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Reason the worker went bad, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn record_status(&mut self, report: &StatusReport) {
        self.stats.record(report);
        self.work_dir = Some(report.work_dir.clone());
    }

    pub(crate) fn connection(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        match self.conn.as_mut() {
            Some(conn) if self.status != WorkerStatus::Bad => Ok(conn.as_mut()),
            _ => Err(ClusterError::ConnectionClosed),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("info", &self.info)
            .field("status", &self.status)
            .field("unique", &self.unique)
            .field("stats", &self.stats)
            .finish()
    }
}

/// The session's worker table, sorted by descending rank then ordinal.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<Worker>,
    master_image: String,
    group_view_owed: bool,
}

impl WorkerRegistry {
    /// `master_image` is the master's own filesystem image; workers sharing
    /// it are never unique.
    pub fn new(master_image: impl Into<String>) -> Self {
        Self {
            workers: Vec::new(),
            master_image: master_image.into(),
            group_view_owed: false,
        }
    }

    fn position(&self, info: &WorkerInfo) -> usize {
        self.workers.partition_point(|w| {
            w.info.perf > info.perf || (w.info.perf == info.perf && w.info.ordinal < info.ordinal)
        })
    }

    /// Register a connected worker. It starts out inactive.
    pub fn add(&mut self, info: WorkerInfo, conn: Box<dyn Connection>) -> WorkerId {
        let id = info.ordinal;
        let at = self.position(&info);
        debug!("Registering worker {} ({}) at rank {}", id, info.host, at);
        self.workers.insert(
            at,
            Worker {
                info,
                conn: Some(conn),
                stats: WorkerStats::default(),
                work_dir: None,
                status: WorkerStatus::Inactive,
                unique: false,
                connected_at: Utc::now(),
                last_error: None,
            },
        );
        id
    }

    /// Register a roster entry that could not be reached.
    pub fn add_bad(&mut self, info: WorkerInfo, reason: impl Into<String>) -> WorkerId {
        let id = info.ordinal;
        let at = self.position(&info);
        self.workers.insert(
            at,
            Worker {
                info,
                conn: None,
                stats: WorkerStats::default(),
                work_dir: None,
                status: WorkerStatus::Bad,
                unique: false,
                connected_at: Utc::now(),
                last_error: Some(reason.into()),
            },
        );
        id
    }

    pub fn find_by_ordinal(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.iter().find(|w| w.info.ordinal == id)
    }

    pub(crate) fn find_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.info.ordinal == id)
    }

    /// Workers on `host`, in rank order.
    pub fn find_by_host(&self, host: &str) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.info.host == host)
            .map(|w| w.info.ordinal)
            .collect()
    }

    /// Iterate the whole table in rank order, bad workers included.
    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    /// Ids of the workers addressed by `scope`, in rank order.
    pub fn ids(&self, scope: Scope) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| match scope {
                Scope::All => w.is_valid(),
                Scope::Active => w.is_active(),
                Scope::Unique => w.unique,
            })
            .map(|w| w.info.ordinal)
            .collect()
    }

    pub fn bad_ids(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| !w.is_valid())
            .map(|w| w.info.ordinal)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.workers.len()
    }

    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_active()).count()
    }

    pub fn unique_count(&self) -> usize {
        self.workers.iter().filter(|w| w.unique).count()
    }

    pub fn bad_count(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_valid()).count()
    }

    pub fn valid_count(&self) -> usize {
        self.total() - self.bad_count()
    }

    /// Move a valid worker between active and inactive. Bad workers stay bad.
    pub(crate) fn set_active(&mut self, id: WorkerId, active: bool) {
        if let Some(worker) = self.find_mut(id) {
            if worker.is_valid() {
                worker.status = if active {
                    WorkerStatus::Active
                } else {
                    WorkerStatus::Inactive
                };
                if !active {
                    worker.unique = false;
                }
            }
        }
    }

    /// Take a worker out of service: it becomes bad, loses its unique flag
    /// and its connection is dropped. Returns false when it was already bad
    /// or unknown.
    pub fn mark_bad(&mut self, id: WorkerId, reason: &str) -> bool {
        let Some(worker) = self.find_mut(id) else {
            return false;
        };
        if !worker.is_valid() {
            return false;
        }

        let uptime = Utc::now().signed_duration_since(worker.connected_at);
        warn!(
            "Marking worker {} ({}, session {}) bad after {}s: {}",
            worker.info.ordinal,
            worker.info.host,
            worker.info.session_token,
            uptime.num_seconds(),
            reason
        );
        let was_active = worker.is_active();
        worker.status = WorkerStatus::Bad;
        worker.unique = false;
        worker.conn = None;
        worker.last_error = Some(reason.to_string());

        if was_active {
            self.group_view_owed = true;
        }
        self.recompute_unique();
        true
    }

    /// Recompute the unique flags: among active workers in rank order, the
    /// first one per image tag is unique, unless it shares the master's image.
    pub fn recompute_unique(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        for worker in self.workers.iter_mut() {
            worker.unique = worker.is_active()
                && worker.info.image != self.master_image
                && seen.insert(worker.info.image.clone());
        }
    }

    pub fn group_view_owed(&self) -> bool {
        self.group_view_owed
    }

    pub(crate) fn owe_group_view(&mut self) {
        self.group_view_owed = true;
    }

    pub(crate) fn settle_group_view(&mut self) {
        self.group_view_owed = false;
    }

    /// Waits for the first of `waiting` to become readable. Returns `None`
    /// when none of them can be waited on.
    pub(crate) async fn wait_readable(
        &mut self,
        waiting: &HashSet<WorkerId>,
    ) -> Option<(WorkerId, Result<()>)> {
        let mut ready: FuturesUnordered<_> = self
            .workers
            .iter_mut()
            .filter(|w| w.is_valid() && waiting.contains(&w.info.ordinal))
            .filter_map(|w| {
                let id = w.info.ordinal;
                w.conn
                    .as_mut()
                    .map(move |conn| async move { (id, conn.readable().await) })
            })
            .collect();
        ready.next().await
    }

    /// Drop every worker. Connections are closed as they are dropped.
    pub(crate) fn clear(&mut self) -> Vec<Worker> {
        self.group_view_owed = false;
        std::mem::take(&mut self.workers)
    }

    pub(crate) async fn close_all(&mut self) {
        for worker in self.workers.iter_mut() {
            if let Some(conn) = worker.conn.as_mut() {
                conn.close().await;
            }
        }
    }
}
