// rust/cluster-core/src/connection.rs

//! The bidirectional channel between the master and one worker.
//!
//! A [`Connection`] carries framed [`Message`]s plus raw byte runs (log
//! output, file contents) on the in-band stream, and single urgent bytes on an
//! out-of-band channel. Every failure is returned to the caller; nothing
//! here retries.

use async_trait::async_trait;

use crate::config::WorkerEntry;
use crate::error::{ClusterError, Result};
use crate::protocol::Message;

/// How a raw send or receive treats the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFlag {
    /// Ordinary in-band bytes.
    Normal,
    /// Urgent bytes on the out-of-band channel.
    OutOfBand,
    /// Inspect the in-band bytes available before the next mark without
    /// consuming them. Never blocks.
    Peek,
}

/// Outcome of a raw receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawRead {
    /// This many bytes were copied into the buffer.
    Bytes(usize),
    /// Out-of-band only: the urgent byte is pending behind in-band data that
    /// must be drained first.
    WouldBlock,
    /// Out-of-band only: no urgent byte has arrived yet.
    NotArrived,
}

/// A bidirectional message channel to a worker.
///
/// Implementations are owned by exactly one worker entry and are only ever
/// driven by the control task, so `&mut self` is sufficient everywhere.
#[async_trait]
pub trait Connection: Send {
    /// Human-readable peer address for logs.
    fn peer(&self) -> &str;

    /// Sends one framed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    async fn send(&mut self, message: &Message) -> Result<()>;

    /// Receives the next framed message, skipping any out-of-band mark.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` when the peer went away, or a protocol
    /// error on an undecodable frame.
    async fn recv(&mut self) -> Result<Message>;

    /// Waits until a call to [`recv`](Self::recv) can make progress, or the
    /// peer has closed.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no data.
    async fn readable(&mut self) -> Result<()>;

    /// Sends raw bytes and returns the number written.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    async fn send_raw(&mut self, bytes: &[u8], flag: RawFlag) -> Result<usize>;

    /// Receives raw bytes. A `Normal` read that starts in front of an
    /// out-of-band mark stops at it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the read fails.
    async fn recv_raw(&mut self, buf: &mut [u8], flag: RawFlag) -> Result<RawRead>;

    /// True when the in-band stream is positioned at the out-of-band mark.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection state cannot be queried.
    async fn at_mark(&mut self) -> Result<bool>;

    /// Closes the connection. Idempotent.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Opens connections to roster entries.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, entry: &WorkerEntry) -> Result<Box<dyn Connection>>;
}

/// Reads exactly `buf.len()` in-band bytes.
pub async fn recv_raw_exact(conn: &mut dyn Connection, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match conn.recv_raw(&mut buf[filled..], RawFlag::Normal).await? {
            RawRead::Bytes(0) => return Err(ClusterError::ConnectionClosed),
            RawRead::Bytes(n) => filled += n,
            // Only possible on the out-of-band channel
            RawRead::WouldBlock | RawRead::NotArrived => {}
        }
    }
    Ok(())
}

/// Writes all of `bytes` in-band.
pub async fn send_raw_all(conn: &mut dyn Connection, bytes: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < bytes.len() {
        let n = conn.send_raw(&bytes[sent..], RawFlag::Normal).await?;
        if n == 0 {
            return Err(ClusterError::ConnectionClosed);
        }
        sent += n;
    }
    Ok(())
}
