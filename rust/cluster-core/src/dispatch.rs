// rust/cluster-core/src/dispatch.rs

//! Handler table of the collect loop.
//!
//! Each incoming message is routed by its tag to one handler, which mutates
//! coordinator state and returns an [`Outcome`]: an optional reply for the
//! sender and what the collect loop should do with that worker next.

use tracing::{debug, warn};

use crate::connection::recv_raw_exact;
use crate::engine::Coordinator;
use crate::error::{ClusterError, Result};
use crate::objects::{ResultObject, StoreOutcome};
use crate::protocol::{Message, StatusReport, WorkRequest};
use crate::registry::WorkerId;

/// What the collect loop does with the sender after a handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Keep listening.
    Continue,
    /// The worker finished its round; stop listening to it.
    Detach,
    MarkBad(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub reply: Option<Message>,
    pub action: Action,
}

impl Outcome {
    fn proceed() -> Self {
        Self {
            reply: None,
            action: Action::Continue,
        }
    }

    fn reply(message: Message) -> Self {
        Self {
            reply: Some(message),
            action: Action::Continue,
        }
    }

    fn detach() -> Self {
        Self {
            reply: None,
            action: Action::Detach,
        }
    }
}

/// Route one message from worker `id` to its handler.
pub(crate) async fn dispatch(coord: &mut Coordinator, id: WorkerId, message: Message) -> Result<Outcome> {
    match message {
        Message::Object(object) => Ok(on_object(coord, object)),
        Message::Fatal => Ok(on_fatal(id)),
        Message::GetWorkItem(request) => on_get_work_item(coord, id, &request),
        Message::GetObject(name) => Ok(on_get_object(coord, &name)),
        Message::LogChunk { size } => {
            stream_log(coord, id, size).await?;
            Ok(Outcome::proceed())
        }
        Message::LogDone { status, parallel } => Ok(on_log_done(coord, id, status, parallel)),
        Message::StatusReport(report) => on_status_report(coord, id, &report),
        Message::OutputList(objects) => {
            coord.results.store_output(objects);
            Ok(Outcome::proceed())
        }
        Message::FeedbackList(objects) => {
            coord.results.store_feedback(id, objects);
            Ok(Outcome::proceed())
        }
        Message::Progress { total, processed } => {
            coord.results.on_progress(total, processed);
            Ok(Outcome::proceed())
        }
        // Keep-alive
        Message::Ping => Ok(Outcome::proceed()),
        other => Err(ClusterError::protocol(format!(
            "unexpected {} during collect",
            other.tag()
        ))),
    }
}

fn on_object(coord: &mut Coordinator, object: ResultObject) -> Outcome {
    let name = object.name.clone();
    match coord.objects.store(object) {
        StoreOutcome::Merged => debug!("Merged partial result '{}'", name),
        StoreOutcome::Replaced => debug!("Replaced result '{}'", name),
        StoreOutcome::Inserted => debug!("Stored result '{}'", name),
    }
    Outcome::proceed()
}

fn on_fatal(id: WorkerId) -> Outcome {
    Outcome {
        reply: None,
        action: Action::MarkBad(format!("worker {} reported a fatal error", id)),
    }
}

fn on_get_work_item(coord: &mut Coordinator, id: WorkerId, request: &WorkRequest) -> Result<Outcome> {
    let info = coord
        .worker_info(id)
        .ok_or_else(|| ClusterError::protocol(format!("work request from unknown worker {}", id)))?;
    let item = coord.distributor.next_work_item(&info, request);
    if item.is_none() {
        debug!("No more work for worker {}", id);
    }
    Ok(Outcome::reply(Message::WorkItem(item)))
}

fn on_get_object(coord: &Coordinator, name: &str) -> Outcome {
    Outcome::reply(Message::ObjectReply(coord.objects.get(name).cloned()))
}

fn on_log_done(coord: &mut Coordinator, id: WorkerId, status: i32, parallel: u32) -> Outcome {
    if status != 0 {
        warn!("Worker {} finished with status {}", id, status);
    }
    coord.record_log_done(status, parallel);
    Outcome::detach()
}

fn on_status_report(coord: &mut Coordinator, id: WorkerId, report: &StatusReport) -> Result<Outcome> {
    let worker = coord
        .registry
        .find_mut(id)
        .ok_or_else(|| ClusterError::protocol(format!("status from unknown worker {}", id)))?;
    worker.record_status(report);

    coord.totals.bytes_read += report.bytes_read;
    coord.totals.real_time += report.real_time;
    coord.totals.cpu_time += report.cpu_time;
    Ok(Outcome::detach())
}

/// Copy `size` raw bytes from the worker to the log sink, in blocks of
/// `transfer.log_block_size`. A failing sink does not stop the drain.
pub(crate) async fn stream_log(coord: &mut Coordinator, id: WorkerId, size: u64) -> Result<()> {
    let block = coord.config.transfer.log_block_size;
    let mut buf = vec![0u8; block];
    let mut remaining = size;
    let mut sink_failed = false;

    while remaining > 0 {
        let n = block.min(remaining as usize);
        recv_raw_exact(coord.connection(id)?, &mut buf[..n]).await?;
        if !sink_failed {
            if let Err(e) = coord.log.write(&buf[..n]) {
                warn!("Log sink failed, discarding output of worker {}: {}", id, e);
                sink_failed = true;
            }
        }
        remaining -= n as u64;
    }
    Ok(())
}
