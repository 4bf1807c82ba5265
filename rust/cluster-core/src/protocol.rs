//! Wire-level message types exchanged between the master and its workers.
//!
//! Every round-trip is a tagged envelope: [`Message`] carries one variant per
//! message kind and [`Message::tag`] yields the discriminant used by the
//! collect loop's handler table. Byte layout is the transport's concern; the
//! TCP transport encodes these with bincode.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::objects::ResultObject;

/// Content checksum of a file or package (xxHash64).
pub type Checksum = u64;

/// Message kind, used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Command,
    Object,
    Fatal,
    GetWorkItem,
    WorkItem,
    GetObject,
    ObjectReply,
    LogChunk,
    LogDone,
    Status,
    StatusReport,
    OutputList,
    FeedbackList,
    Progress,
    GroupView,
    CheckFile,
    SendFile,
    Cache,
    ParallelSetup,
    Ping,
    LogLevel,
    Reset,
    Print,
    NotOk,
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "command-execute",
            Self::Object => "raw-object",
            Self::Fatal => "fatal-error",
            Self::GetWorkItem => "get-next-work-item",
            Self::WorkItem => "work-item",
            Self::GetObject => "get-object",
            Self::ObjectReply => "object-reply",
            Self::LogChunk => "log-chunk",
            Self::LogDone => "log-done",
            Self::Status => "status",
            Self::StatusReport => "status-report",
            Self::OutputList => "output-list",
            Self::FeedbackList => "feedback-list",
            Self::Progress => "progress",
            Self::GroupView => "group-view",
            Self::CheckFile => "check-file",
            Self::SendFile => "send-file",
            Self::Cache => "cache-op",
            Self::ParallelSetup => "parallel-setup",
            Self::Ping => "ping",
            Self::LogLevel => "log-level",
            Self::Reset => "reset",
            Self::Print => "print",
            Self::NotOk => "not-ok",
        };
        f.write_str(name)
    }
}

/// Payload of a worker's request for its next unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Entries processed since the previous request.
    pub processed: u64,
    /// Wall-clock time spent on the previous unit, in milliseconds.
    pub elapsed_ms: u64,
}

/// Descriptor of one unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub file_name: String,
    pub directory: String,
    pub object_name: String,
    /// First entry of the unit.
    pub first: u64,
    /// Number of entries in the unit.
    pub count: u64,
}

/// Statistics a worker reports in answer to a status request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub bytes_read: u64,
    /// Real time in seconds.
    pub real_time: f64,
    /// CPU time in seconds.
    pub cpu_time: f64,
    /// Remote working directory.
    pub work_dir: String,
}

/// Sub-commands of the cache-op message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheOp {
    ShowCache { all: bool },
    ClearCache,
    ShowPackages { all: bool },
    ClearPackages,
    ClearPackage(String),
    BuildPackage(String),
    LoadPackage(String),
    ShowEnabledPackages { all: bool },
}

/// Kind of urgent (out-of-band) signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// Abort the current computation; the in-band stream is flushed.
    Hard,
    /// Ask the worker to stop at the next convenient point.
    Soft,
    /// Terminate the worker. No reply is expected.
    Shutdown,
}

impl InterruptKind {
    /// Byte sent on the out-of-band channel.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Hard => 1,
            Self::Soft => 2,
            Self::Shutdown => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Hard),
            2 => Some(Self::Soft),
            3 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// A message on a worker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Command line to execute remotely.
    Command(String),
    /// A result object (possibly a mergeable partial result).
    Object(ResultObject),
    /// The worker hit an unrecoverable error.
    Fatal,
    GetWorkItem(WorkRequest),
    /// Reply to `GetWorkItem`; `None` means no more work.
    WorkItem(Option<WorkItem>),
    /// Lookup of a named object in the master's result scope.
    GetObject(String),
    /// Reply to `GetObject`; `None` means not found.
    ObjectReply(Option<ResultObject>),
    /// Announces `size` raw bytes of log output following in-band.
    LogChunk { size: u64 },
    /// End of a round for this worker.
    LogDone { status: i32, parallel: u32 },
    /// Status request sent by the master.
    Status,
    StatusReport(StatusReport),
    OutputList(Vec<ResultObject>),
    FeedbackList(Vec<ResultObject>),
    Progress { total: u64, processed: u64 },
    /// Position of the receiving worker within the active set.
    GroupView { index: u32, size: u32 },
    /// Probe (and, as a reply, confirmation) of a remote file by checksum.
    CheckFile { name: String, checksum: Checksum },
    /// Announces a file transfer of `size` raw bytes.
    SendFile { name: String, binary: bool, size: u64 },
    Cache(CacheOp),
    ParallelSetup { count: u32, port: u16 },
    Ping,
    LogLevel { level: i32, mask: u32 },
    /// Reset the remote environment into the given directory.
    Reset(String),
    Print,
    NotOk,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::Command(_) => MessageTag::Command,
            Self::Object(_) => MessageTag::Object,
            Self::Fatal => MessageTag::Fatal,
            Self::GetWorkItem(_) => MessageTag::GetWorkItem,
            Self::WorkItem(_) => MessageTag::WorkItem,
            Self::GetObject(_) => MessageTag::GetObject,
            Self::ObjectReply(_) => MessageTag::ObjectReply,
            Self::LogChunk { .. } => MessageTag::LogChunk,
            Self::LogDone { .. } => MessageTag::LogDone,
            Self::Status => MessageTag::Status,
            Self::StatusReport(_) => MessageTag::StatusReport,
            Self::OutputList(_) => MessageTag::OutputList,
            Self::FeedbackList(_) => MessageTag::FeedbackList,
            Self::Progress { .. } => MessageTag::Progress,
            Self::GroupView { .. } => MessageTag::GroupView,
            Self::CheckFile { .. } => MessageTag::CheckFile,
            Self::SendFile { .. } => MessageTag::SendFile,
            Self::Cache(_) => MessageTag::Cache,
            Self::ParallelSetup { .. } => MessageTag::ParallelSetup,
            Self::Ping => MessageTag::Ping,
            Self::LogLevel { .. } => MessageTag::LogLevel,
            Self::Reset(_) => MessageTag::Reset,
            Self::Print => MessageTag::Print,
            Self::NotOk => MessageTag::NotOk,
        }
    }

    /// Terminal tags end a worker's participation in a collect round.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LogDone { .. } | Self::StatusReport(_))
    }
}
