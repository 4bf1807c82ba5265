// rust/cluster-core/src/lib.rs

//! Parallel Compute Cluster - Master Core
//!
//! This crate turns a set of remote worker processes into one logical
//! compute cluster: the worker table, the broadcast/collect engine, urgent
//! interrupts, the checksum-gated file cache and the package lifecycle.

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{ClusterConfig, Role, Roster, WorkerEntry};
pub use connection::{Connection, Connector, RawFlag, RawRead};
pub use error::{ClusterError, Result};
pub use protocol::{CacheOp, InterruptKind, Message, MessageTag};
pub use transport::{pair, MemoryConnection, TcpBulkTransfer, TcpConnection, TcpTransport};

pub mod objects;
pub mod registry;
pub mod sink;
pub use objects::{Histogram1D, ObjectPayload, ObjectScope, ResultObject};
pub use registry::{Scope, Worker, WorkerId, WorkerInfo, WorkerRegistry, WorkerStatus};
pub use sink::{BulkTransfer, LogSink, ResultSink, WorkDistributor};

mod dispatch;
pub mod engine;
pub use engine::{ClusterSummary, Coordinator, RoundTotals};

pub mod file_cache;
pub mod interrupt;
pub mod package;
mod parallel;
mod session;
mod transfer;
pub use file_cache::{CacheEntry, FileCache};
pub use interrupt::InterruptReport;
pub use package::UploadReport;

#[cfg(test)]
pub(crate) mod testing;
