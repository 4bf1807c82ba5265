// rust/cluster-core/src/sink.rs

//! Collaborators the coordinator hands work to: the work distributor, the
//! log and result sinks, and the bulk-transfer channel used for packages.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::Result;
use crate::objects::ResultObject;
use crate::protocol::{WorkItem, WorkRequest};
use crate::registry::{WorkerId, WorkerInfo};

/// Decides the next unit of work for a worker that asked for one.
pub trait WorkDistributor: Send {
    /// Returns `None` when there is no more work for this worker.
    fn next_work_item(&mut self, worker: &WorkerInfo, request: &WorkRequest) -> Option<WorkItem>;
}

/// Receives worker log output.
pub trait LogSink: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Receives the results of a round.
pub trait ResultSink: Send {
    fn store_output(&mut self, objects: Vec<ResultObject>);

    fn store_feedback(&mut self, worker: WorkerId, objects: Vec<ResultObject>);

    fn on_progress(&mut self, total: u64, processed: u64);
}

/// Side channel used to push large files (packages) to a worker.
#[async_trait]
pub trait BulkTransfer: Send {
    /// Uploads `source` to `remote_path` on `target` across up to `streams`
    /// parallel streams. Returns the number of bytes transferred.
    async fn put(
        &mut self,
        target: &WorkerInfo,
        source: &Path,
        remote_path: &str,
        streams: u32,
    ) -> Result<u64>;
}

/// Hands out a fixed queue of work items first come, first served.
#[derive(Debug, Default)]
pub struct QueueDistributor {
    items: VecDeque<WorkItem>,
    handed_out: Vec<(WorkerId, WorkItem)>,
}

impl QueueDistributor {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
            handed_out: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    /// Items handed out so far, with the worker that received each.
    pub fn handed_out(&self) -> &[(WorkerId, WorkItem)] {
        &self.handed_out
    }
}

impl WorkDistributor for QueueDistributor {
    fn next_work_item(&mut self, worker: &WorkerInfo, _request: &WorkRequest) -> Option<WorkItem> {
        let item = self.items.pop_front()?;
        self.handed_out.push((worker.ordinal, item.clone()));
        Some(item)
    }
}

/// Writes worker output to the master's stdout.
#[derive(Debug, Default)]
pub struct StdoutLog;

impl LogSink for StdoutLog {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(bytes)?;
        out.flush()
    }
}

/// Accumulates log output in memory; clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferLog {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl BufferLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LogSink for BufferLog {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        Ok(())
    }
}

/// Collected round results; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct CollectedResults {
    inner: Arc<Mutex<ResultsState>>,
}

#[derive(Debug, Default, Clone)]
pub struct ResultsState {
    pub output: Vec<ResultObject>,
    pub feedback: Vec<(WorkerId, Vec<ResultObject>)>,
    /// Last (total, processed) report.
    pub progress: Option<(u64, u64)>,
    pub progress_reports: usize,
}

impl CollectedResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ResultsState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ResultSink for CollectedResults {
    fn store_output(&mut self, objects: Vec<ResultObject>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .output
            .extend(objects);
    }

    fn store_feedback(&mut self, worker: WorkerId, objects: Vec<ResultObject>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feedback
            .push((worker, objects));
    }

    fn on_progress(&mut self, total: u64, processed: u64) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.progress = Some((total, processed));
        state.progress_reports += 1;
    }
}
