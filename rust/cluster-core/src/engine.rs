// rust/cluster-core/src/engine.rs

//! The broadcast/collect engine.
//!
//! A [`Coordinator`] owns the worker table, the file cache and the result
//! scope, and is the only thing that ever touches a worker connection.
//! Broadcasts are fire-and-forget; [`Coordinator::collect_workers`] is the
//! single blocking wait, racing the readiness of every connection in its
//! wait-set and dispatching each message through the handler table in
//! [`crate::dispatch`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::connection::{send_raw_all, Connection};
use crate::dispatch::{self, Action};
use crate::error::{ClusterError, Result};
use crate::file_cache::FileCache;
use crate::objects::{ObjectScope, ResultObject};
use crate::protocol::{InterruptKind, Message};
use crate::registry::{Scope, WorkerId, WorkerInfo, WorkerRegistry, WorkerStatus};
use crate::sink::{BulkTransfer, CollectedResults, LogSink, QueueDistributor, ResultSink, StdoutLog, WorkDistributor};
use crate::transport::TcpBulkTransfer;

/// Totals accumulated from status reports during the last round.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundTotals {
    pub bytes_read: u64,
    pub real_time: f64,
    pub cpu_time: f64,
}

/// The master-side coordinator of one session.
pub struct Coordinator {
    pub(crate) config: ClusterConfig,
    pub(crate) registry: WorkerRegistry,
    pub(crate) file_cache: FileCache,
    pub(crate) objects: ObjectScope,
    pub(crate) distributor: Box<dyn WorkDistributor>,
    pub(crate) log: Box<dyn LogSink>,
    pub(crate) results: Box<dyn ResultSink>,
    pub(crate) bulk: Box<dyn BulkTransfer>,
    pub(crate) totals: RoundTotals,
    status: i32,
    parallel: u32,
    parallel_reports: u32,
    async_input: bool,
    collecting: bool,
    closed: bool,
}

impl Coordinator {
    /// Creates a coordinator with no workers, logging to stdout and
    /// uploading packages over TCP.
    pub fn new(config: ClusterConfig) -> Self {
        let bulk = TcpBulkTransfer::new(&config);
        let registry = WorkerRegistry::new(config.session.image.clone());
        Self {
            config,
            registry,
            file_cache: FileCache::new(),
            objects: ObjectScope::new(),
            distributor: Box::new(QueueDistributor::default()),
            log: Box::new(StdoutLog),
            results: Box::new(CollectedResults::new()),
            bulk: Box::new(bulk),
            totals: RoundTotals::default(),
            status: 0,
            parallel: 0,
            parallel_reports: 0,
            async_input: true,
            collecting: false,
            closed: false,
        }
    }

    #[must_use]
    pub fn with_distributor(mut self, distributor: impl WorkDistributor + 'static) -> Self {
        self.distributor = Box::new(distributor);
        self
    }

    #[must_use]
    pub fn with_log_sink(mut self, log: impl LogSink + 'static) -> Self {
        self.log = Box::new(log);
        self
    }

    #[must_use]
    pub fn with_result_sink(mut self, results: impl ResultSink + 'static) -> Self {
        self.results = Box::new(results);
        self
    }

    #[must_use]
    pub fn with_bulk_transfer(mut self, bulk: impl BulkTransfer + 'static) -> Self {
        self.bulk = Box::new(bulk);
        self
    }

    /// Replace the distributor between rounds.
    pub fn set_distributor(&mut self, distributor: impl WorkDistributor + 'static) {
        self.distributor = Box::new(distributor);
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn objects(&self) -> &ObjectScope {
        &self.objects
    }

    pub fn file_cache(&self) -> &FileCache {
        &self.file_cache
    }

    /// Register a connected worker. It starts out inactive.
    pub fn add_worker(&mut self, info: WorkerInfo, conn: Box<dyn Connection>) -> WorkerId {
        self.registry.add(info, conn)
    }

    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Status of the last round: the last non-zero status a worker reported
    /// with log-done, else zero.
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Parallelism reported by the workers' log-done messages.
    pub fn parallel(&self) -> u32 {
        self.parallel
    }

    pub fn totals(&self) -> RoundTotals {
        self.totals
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn record_log_done(&mut self, status: i32, parallel: u32) {
        if status != 0 {
            self.status = status;
        }
        self.parallel_reports += parallel;
    }

    pub(crate) fn worker_info(&self, id: WorkerId) -> Option<WorkerInfo> {
        self.registry.find_by_ordinal(id).map(|w| w.info().clone())
    }

    /// Sends one message to one worker without touching its status.
    pub(crate) async fn send_to(&mut self, id: WorkerId, message: &Message) -> Result<()> {
        let worker = self
            .registry
            .find_mut(id)
            .ok_or(ClusterError::ConnectionClosed)?;
        worker.connection()?.send(message).await
    }

    pub(crate) async fn recv_from(&mut self, id: WorkerId) -> Result<Message> {
        let worker = self
            .registry
            .find_mut(id)
            .ok_or(ClusterError::ConnectionClosed)?;
        worker.connection()?.recv().await
    }

    pub(crate) fn connection(&mut self, id: WorkerId) -> Result<&mut (dyn Connection + 'static)> {
        self.registry
            .find_mut(id)
            .ok_or(ClusterError::ConnectionClosed)?
            .connection()
    }

    pub(crate) fn mark_bad(&mut self, id: WorkerId, err: &ClusterError) {
        self.registry.mark_bad(id, &err.to_string());
    }

    /// Send `message` to every valid worker of `ids`, in order. A send
    /// failure marks that worker bad. Returns the number of deliveries.
    pub async fn broadcast(&mut self, message: &Message, ids: &[WorkerId]) -> usize {
        let mut sent = 0;
        for &id in ids {
            if !self.registry.find_by_ordinal(id).is_some_and(|w| w.is_valid()) {
                continue;
            }
            match self.send_to(id, message).await {
                Ok(()) => sent += 1,
                Err(e) => self.mark_bad(id, &e),
            }
        }
        debug!("Broadcast {} to {}/{} workers", message.tag(), sent, ids.len());
        sent
    }

    pub async fn broadcast_scope(&mut self, message: &Message, scope: Scope) -> usize {
        let ids = self.registry.ids(scope);
        self.broadcast(message, &ids).await
    }

    /// Send a raw buffer in-band to every valid worker of `ids`.
    pub async fn broadcast_raw(&mut self, bytes: &[u8], ids: &[WorkerId]) -> usize {
        let mut sent = 0;
        for &id in ids {
            let result = match self.connection(id) {
                Ok(conn) => send_raw_all(conn, bytes).await,
                Err(_) => continue,
            };
            match result {
                Ok(()) => sent += 1,
                Err(e) => self.mark_bad(id, &e),
            }
        }
        sent
    }

    pub async fn collect_worker(&mut self, id: WorkerId) -> usize {
        self.collect_workers(&[id]).await
    }

    pub async fn collect_scope(&mut self, scope: Scope) -> usize {
        let ids = self.registry.ids(scope);
        self.collect_workers(&ids).await
    }

    /// Wait for every valid worker of `ids` to end its round with log-done
    /// or a status report, or to go bad. Returns the number of messages
    /// handled; messages whose receive failed are not counted.
    pub async fn collect_workers(&mut self, ids: &[WorkerId]) -> usize {
        let mut waiting: HashSet<WorkerId> = ids
            .iter()
            .copied()
            .filter(|&id| self.registry.find_by_ordinal(id).is_some_and(|w| w.is_valid()))
            .collect();

        let async_input = std::mem::replace(&mut self.async_input, false);
        self.collecting = true;
        self.totals = RoundTotals::default();
        self.status = 0;
        self.parallel_reports = 0;
        let mut reported_parallel = false;
        let mut handled = 0;

        while !waiting.is_empty() {
            let Some((id, ready)) = self.registry.wait_readable(&waiting).await else {
                break;
            };

            let message = match ready {
                Ok(()) => self.recv_from(id).await,
                Err(e) => Err(e),
            };
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    self.mark_bad(id, &e);
                    waiting.remove(&id);
                    continue;
                }
            };
            handled += 1;
            if matches!(message, Message::LogDone { .. }) {
                reported_parallel = true;
            }

            let tag = message.tag();
            match dispatch::dispatch(self, id, message).await {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply {
                        if let Err(e) = self.send_to(id, &reply).await {
                            self.mark_bad(id, &e);
                        }
                    }
                    match outcome.action {
                        Action::Continue => {}
                        Action::Detach => {
                            waiting.remove(&id);
                        }
                        Action::MarkBad(reason) => {
                            self.registry.mark_bad(id, &reason);
                        }
                    }
                }
                Err(e) if e.is_connection_failure() => self.mark_bad(id, &e),
                Err(e) => warn!("Worker {}: error handling {}: {}", id, tag, e),
            }

            waiting.retain(|&w| self.registry.find_by_ordinal(w).is_some_and(|w| w.is_valid()));
        }

        if reported_parallel {
            self.parallel = self.parallel_reports;
        }
        self.send_group_view().await;
        self.collecting = false;
        self.async_input = async_input;
        handled
    }

    /// Tell each active worker its (index, size) position, if a new view is
    /// owed. A failed send marks the worker bad and restarts the view.
    pub async fn send_group_view(&mut self) {
        while self.registry.group_view_owed() {
            self.registry.settle_group_view();
            let active = self.registry.ids(Scope::Active);
            let size = active.len() as u32;
            for (index, &id) in active.iter().enumerate() {
                let view = Message::GroupView {
                    index: index as u32,
                    size,
                };
                if let Err(e) = self.send_to(id, &view).await {
                    self.mark_bad(id, &e);
                    break;
                }
            }
        }
    }

    pub fn async_input_enabled(&self) -> bool {
        self.async_input && !self.collecting
    }

    pub fn set_async_input(&mut self, enabled: bool) {
        self.async_input = enabled;
    }

    /// Handle unsolicited messages arriving between rounds for up to `wait`.
    /// Pings are absorbed, log output is forwarded, anything else is logged
    /// and dropped. Returns the number of messages handled.
    pub async fn service_async_input(&mut self, wait: Duration) -> usize {
        if !self.async_input_enabled() {
            return 0;
        }

        let deadline = tokio::time::Instant::now() + wait;
        let mut handled = 0;
        loop {
            let all: HashSet<WorkerId> = self.registry.ids(Scope::All).into_iter().collect();
            let ready = tokio::time::timeout_at(deadline, self.registry.wait_readable(&all)).await;
            let Ok(Some((id, ready))) = ready else {
                break;
            };

            let message = match ready {
                Ok(()) => self.recv_from(id).await,
                Err(e) => Err(e),
            };
            match message {
                Ok(Message::Ping) => debug!("Ping from worker {}", id),
                Ok(Message::LogChunk { size }) => {
                    if let Err(e) = dispatch::stream_log(self, id, size).await {
                        self.mark_bad(id, &e);
                    }
                }
                Ok(other) => warn!("Unsolicited {} from worker {} dropped", other.tag(), id),
                Err(e) => {
                    self.mark_bad(id, &e);
                    continue;
                }
            }
            handled += 1;
        }
        handled
    }

    /// Status-report round-trip with every active worker.
    pub async fn ask_status(&mut self) -> usize {
        let ids = self.registry.ids(Scope::Active);
        self.broadcast(&Message::Status, &ids).await;
        self.collect_workers(&ids).await
    }

    /// Liveness probe: workers that cannot be written to are marked bad.
    pub async fn ping(&mut self, scope: Scope) -> usize {
        self.broadcast_scope(&Message::Ping, scope).await
    }

    pub async fn set_log_level(&mut self, level: i32, mask: u32) -> usize {
        self.config.session.log_level = level;
        self.config.session.log_mask = mask;
        self.broadcast_scope(&Message::LogLevel { level, mask }, Scope::All)
            .await
    }

    /// Reset the workers of `scope` into the session's working directory.
    pub async fn send_current_state(&mut self, scope: Scope) -> i32 {
        let ids = self.registry.ids(scope);
        let reset = Message::Reset(self.config.session.work_dir.clone());
        self.broadcast(&reset, &ids).await;
        self.collect_workers(&ids).await;
        self.status
    }

    /// Run `command` on the workers of `scope` and return the round status,
    /// or -1 when no worker received it.
    pub async fn send_command(&mut self, command: &str, scope: Scope) -> i32 {
        let ids = self.registry.ids(scope);
        let sent = self.broadcast(&Message::Command(command.to_string()), &ids).await;
        if sent == 0 {
            warn!("Command not delivered to any worker: {}", command);
            self.status = -1;
            return self.status;
        }
        self.collect_workers(&ids).await;
        self.status
    }

    /// Like [`send_command`](Self::send_command), but `.L`, `.x` and `.X`
    /// commands first ship the named macro to the workers.
    ///
    /// Without unique workers every worker shares the master's filesystem,
    /// so nothing is shipped and the command names the macro's full path.
    pub async fn exec(&mut self, command: &str, scope: Scope) -> Result<i32> {
        let command = command.trim();
        let Some(name) = macro_file(command) else {
            return Ok(self.send_command(command, scope).await);
        };
        let path = self
            .find_macro(name)
            .ok_or_else(|| ClusterError::io(name, "macro not found on session.macro_path"))?;

        if self.registry.unique_count() == 0 {
            let local = command.replacen(name, &path.display().to_string(), 1);
            return Ok(self.send_command(&local, scope).await);
        }
        self.send_file(&path, false).await?;
        Ok(self.send_command(command, scope).await)
    }

    fn find_macro(&self, name: &str) -> Option<PathBuf> {
        let direct = Path::new(name);
        if direct.is_absolute() {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        self.config
            .session
            .macro_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Broadcast a result object to the workers of `scope` and wait for them.
    pub async fn send_object(&mut self, object: ResultObject, scope: Scope) -> usize {
        let ids = self.registry.ids(scope);
        let sent = self.broadcast(&Message::Object(object), &ids).await;
        self.collect_workers(&ids).await;
        sent
    }

    pub fn print(&self) -> ClusterSummary {
        ClusterSummary {
            workers: self
                .registry
                .iter()
                .map(|w| WorkerSummary {
                    ordinal: w.ordinal(),
                    host: w.info().host.clone(),
                    perf: w.info().perf,
                    image: w.info().image.clone(),
                    status: w.status(),
                    unique: w.is_unique(),
                    work_dir: w.work_dir().map(str::to_string),
                    session: w.info().session_token.clone(),
                    connected_at: w.connected_at(),
                    bytes_read: w.stats().bytes_read,
                    cpu_time: w.stats().cpu_time,
                })
                .collect(),
            active: self.registry.active_count(),
            unique: self.registry.unique_count(),
            bad: self.registry.bad_count(),
            parallel: self.parallel,
        }
    }

    /// Shut every worker down and release the session.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt(InterruptKind::Shutdown, Scope::All).await;
        self.registry.close_all().await;
        let workers = self.registry.clear();
        self.file_cache.clear();
        self.objects.clear();
        self.closed = true;
        info!("Session closed ({} workers released)", workers.len());
    }
}

/// The file named by a `.L`, `.x` or `.X` command, without arguments or
/// compilation suffixes.
fn macro_file(command: &str) -> Option<&str> {
    let command = command.trim_start();
    let rest = [".L", ".x", ".X"]
        .iter()
        .find_map(|prefix| command.strip_prefix(prefix))?;
    let target = rest.trim();
    let end = target.find('(').unwrap_or(target.len());
    let name = target[..end].trim_end().trim_end_matches('+');
    (!name.is_empty()).then_some(name)
}

#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub ordinal: WorkerId,
    pub host: String,
    pub perf: u32,
    pub image: String,
    pub status: WorkerStatus,
    pub unique: bool,
    pub work_dir: Option<String>,
    pub session: String,
    pub connected_at: DateTime<Utc>,
    pub bytes_read: u64,
    pub cpu_time: f64,
}

/// Snapshot of the session returned by [`Coordinator::print`].
#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub workers: Vec<WorkerSummary>,
    pub active: usize,
    pub unique: usize,
    pub bad: usize,
    pub parallel: u32,
}

impl fmt::Display for ClusterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Workers: {} total, {} active, {} unique, {} bad; parallelism {}",
            self.workers.len(),
            self.active,
            self.unique,
            self.bad,
            self.parallel
        )?;
        for w in &self.workers {
            let status = match w.status {
                WorkerStatus::Active if w.unique => "active*",
                WorkerStatus::Active => "active",
                WorkerStatus::Inactive => "inactive",
                WorkerStatus::Bad => "bad",
            };
            writeln!(
                f,
                "  {:>4}  {:<24} perf={:<5} image={:<12} {:<9} read={}B cpu={:.2}s dir={} session={} since={}",
                w.ordinal,
                w.host,
                w.perf,
                w.image,
                status,
                w.bytes_read,
                w.cpu_time,
                w.work_dir.as_deref().unwrap_or("-"),
                w.session.get(..8).unwrap_or(w.session.as_str()),
                w.connected_at.format("%Y-%m-%d %H:%M:%S")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatusReport;
    use crate::testing::{
        coordinator_with, spawn_worker, FakeWorker, WorkerScript,
    };

    #[test]
    fn test_macro_file() {
        assert_eq!(macro_file(".x analysis.C"), Some("analysis.C"));
        assert_eq!(macro_file(".L lib.C+"), Some("lib.C"));
        assert_eq!(macro_file(".X  run.C++(10, \"a\")"), Some("run.C"));
        assert_eq!(macro_file(".xanalysis.C"), Some("analysis.C"));
        assert_eq!(macro_file("gSystem->Exec(\"ls\")"), None);
        assert_eq!(macro_file(".x"), None);
    }

    #[tokio::test]
    async fn test_undelivered_command_reports_failure() {
        let mut coord = Coordinator::new(ClusterConfig::default());
        let script = WorkerScript::default().exit_status(4);
        let (info, conn, _h) = spawn_worker(0, FakeWorker::new("w0", script));
        coord.add_worker(info, conn);
        coord.registry.set_active(0, true);
        assert_eq!(coord.send_command("run", Scope::Active).await, 4);

        coord.registry.set_active(0, false);
        assert_eq!(coord.send_command("run", Scope::Active).await, -1);
        assert_eq!(coord.status(), -1);
        assert_eq!(coord.exec("gSystem->Exec(\"ls\")", Scope::Active).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_exec_on_shared_filesystem_uses_full_macro_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("analysis.C");
        std::fs::write(&path, b"void analysis(int) {}\n").unwrap();
        let mut config = ClusterConfig::default();
        config.session.macro_path = vec![dir.path().to_path_buf()];
        let (mut coord, mut peers) = crate::testing::coordinator_with_config(config, 1);
        coord.registry.set_active(0, true);
        assert_eq!(coord.registry.unique_count(), 0);

        peers[0].send(&Message::LogDone { status: 0, parallel: 1 }).await.unwrap();
        assert_eq!(coord.exec("  .xanalysis.C(1)", Scope::Active).await.unwrap(), 0);
        assert_eq!(
            peers[0].recv().await.unwrap(),
            Message::Command(format!(".x{}(1)", path.display()))
        );

        let err = coord.exec(".L missing.C+", Scope::Active).await.unwrap_err();
        assert!(matches!(err, ClusterError::Io { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_delivers_once_in_list_order() {
        let (mut coord, mut peers) = coordinator_with(3);
        let ids = coord.registry.ids(Scope::All);

        let sent = coord.broadcast(&Message::Print, &ids).await;
        assert_eq!(sent, 3);
        for peer in peers.iter_mut() {
            assert_eq!(peer.recv().await.unwrap(), Message::Print);
        }
    }

    #[tokio::test]
    async fn test_broadcast_marks_failed_send_bad() {
        let (mut coord, mut peers) = coordinator_with(3);
        for id in coord.registry.ids(Scope::All) {
            coord.registry.set_active(id, true);
        }
        // The second worker goes away before the broadcast
        let gone = peers.remove(1);
        drop(gone);

        let ids = coord.registry.ids(Scope::Active);
        let sent = coord.broadcast(&Message::Command("ls".into()), &ids).await;
        assert_eq!(sent, 2);
        assert_eq!(coord.registry.bad_ids(), vec![1]);
        assert_eq!(coord.active_count(), 2);
    }

    // Scenario B: one of three workers closes mid-round.
    #[tokio::test]
    async fn test_collect_after_worker_loss() {
        let mut coord = Coordinator::new(ClusterConfig::default());
        let mut handles = Vec::new();
        for i in 0..3 {
            let script = if i == 1 {
                WorkerScript::default().vanish()
            } else {
                WorkerScript::default()
            };
            let (info, conn, handle) = spawn_worker(i, FakeWorker::new(format!("w{}", i), script));
            coord.add_worker(info, conn);
            coord.registry.set_active(i, true);
            handles.push(handle);
        }
        // The vanishing worker's end is gone once its task exits
        handles.remove(1).await.unwrap();

        let ids = coord.registry.ids(Scope::Active);
        let sent = coord.broadcast(&Message::Command("run".into()), &ids).await;
        assert_eq!(sent, 2);
        assert_eq!(coord.registry.bad_ids(), vec![1]);

        let handled = coord.collect_scope(Scope::Active).await;
        assert_eq!(handled, 2);
        assert_eq!(coord.status(), 0);
        assert_eq!(coord.parallel(), 2);
    }

    #[tokio::test]
    async fn test_collect_dispatches_round_messages() {
        let mut coord = Coordinator::new(ClusterConfig::default());
        let script = WorkerScript::default()
            .on_command(vec![
                Message::Progress { total: 10, processed: 5 },
                Message::LogChunk { size: 6 },
            ])
            .with_log(b"hello\n".to_vec())
            .exit_status(3);
        let (info, conn, _handle) = spawn_worker(0, FakeWorker::new("w0", script));
        coord.add_worker(info, conn);
        coord.registry.set_active(0, true);
        let log = crate::sink::BufferLog::new();
        let results = CollectedResults::new();
        coord = coord.with_log_sink(log.clone()).with_result_sink(results.clone());

        let status = coord.send_command("run", Scope::Active).await;
        assert_eq!(status, 3);
        assert_eq!(log.contents(), b"hello\n");
        assert_eq!(results.snapshot().progress, Some((10, 5)));
        // A non-zero status does not invalidate the worker
        assert_eq!(coord.active_count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_marks_worker_bad() {
        let mut coord = Coordinator::new(ClusterConfig::default());
        let (info, conn, _h0) = spawn_worker(
            0,
            FakeWorker::new("w0", WorkerScript::default().on_command(vec![Message::Fatal])),
        );
        coord.add_worker(info, conn);
        let (info, conn, _h1) = spawn_worker(1, FakeWorker::new("w1", WorkerScript::default()));
        coord.add_worker(info, conn);
        coord.registry.set_active(0, true);
        coord.registry.set_active(1, true);

        coord.send_command("run", Scope::Active).await;
        assert_eq!(coord.registry.bad_ids(), vec![0]);
        assert_eq!(coord.active_count(), 1);
    }

    #[tokio::test]
    async fn test_ask_status_records_totals_and_work_dir() {
        let mut coord = Coordinator::new(ClusterConfig::default());
        for i in 0..2 {
            let script = WorkerScript::default().status(StatusReport {
                bytes_read: 100 * (i as u64 + 1),
                real_time: 1.0,
                cpu_time: 0.5,
                work_dir: format!("/scratch/w{}", i),
            });
            let (info, conn, _h) = spawn_worker(i, FakeWorker::new(format!("w{}", i), script));
            coord.add_worker(info, conn);
            coord.registry.set_active(i, true);
        }

        assert_eq!(coord.ask_status().await, 2);
        assert_eq!(coord.totals().bytes_read, 300);
        assert_eq!(coord.totals().cpu_time, 1.0);
        let w1 = coord.registry.find_by_ordinal(1).unwrap();
        assert_eq!(w1.work_dir(), Some("/scratch/w1"));
        assert_eq!(w1.stats().bytes_read, 200);
    }

    #[tokio::test]
    async fn test_group_view_sent_after_loss() {
        let (mut coord, mut peers) = coordinator_with(3);
        for id in 0..3 {
            coord.registry.set_active(id, true);
        }
        drop(peers.remove(0));
        coord.registry.owe_group_view();

        coord.send_group_view().await;
        assert!(!coord.registry.group_view_owed());
        assert_eq!(coord.registry.bad_ids(), vec![0]);
        assert_eq!(peers[0].recv().await.unwrap(), Message::GroupView { index: 0, size: 2 });
        assert_eq!(peers[1].recv().await.unwrap(), Message::GroupView { index: 1, size: 2 });
    }

    #[tokio::test]
    async fn test_async_input_absorbs_pings() {
        let (mut coord, mut peers) = coordinator_with(2);
        peers[0].send(&Message::Ping).await.unwrap();
        peers[1].send(&Message::Progress { total: 1, processed: 1 }).await.unwrap();

        let handled = coord.service_async_input(Duration::from_millis(50)).await;
        assert_eq!(handled, 2);
        assert_eq!(coord.registry.bad_count(), 0);

        coord.set_async_input(false);
        peers[0].send(&Message::Ping).await.unwrap();
        assert_eq!(coord.service_async_input(Duration::from_millis(10)).await, 0);
    }

    #[tokio::test]
    async fn test_print_summary() {
        let (mut coord, _peers) = coordinator_with(2);
        coord.registry.set_active(0, true);
        coord.registry.recompute_unique();
        coord.registry.mark_bad(1, "gone");

        let summary = coord.print();
        assert_eq!(summary.active, 1);
        assert_eq!(summary.bad, 1);
        let text = summary.to_string();
        assert!(text.contains("1 active"));
        assert!(text.contains("active*"));
        assert!(text.contains("bad"));
        let token = &summary.workers[0].session;
        assert_eq!(token.len(), 36);
        assert_ne!(token, &summary.workers[1].session);
        assert!(text.contains(&format!("session={}", &token[..8])));
        assert!(summary.workers[0].connected_at <= chrono::Utc::now());
        assert!(text.contains(&summary.workers[0].connected_at.format("since=%Y-%m-%d").to_string()));
    }
}
