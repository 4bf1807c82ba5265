// rust/cluster-core/src/transport/memory.rs

//! In-process duplex connection.
//!
//! Each direction is a [`Pipe`] of typed segments. Urgent bytes travel in a
//! separate queue and leave a [`Segment::Mark`] in the in-band queue at the
//! position they were sent, so flushing up to the mark behaves as it does on
//! a socket. An urgent byte is only delivered once the in-band data queued in
//! front of its mark has been drained.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::sync::Notify;

use super::encode_frame;
use crate::connection::{Connection, RawFlag, RawRead};
use crate::error::{ClusterError, Result};
use crate::protocol::Message;

enum Segment {
    Frame(Message),
    Data(Bytes),
    Mark,
}

impl Segment {
    fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Self::Frame(message) => encode_frame(message),
            Self::Data(bytes) => Ok(bytes.clone()),
            Self::Mark => Ok(Bytes::new()),
        }
    }
}

#[derive(Default)]
struct PipeState {
    queue: VecDeque<Segment>,
    urgent: VecDeque<u8>,
    closed: bool,
}

impl PipeState {
    fn skip_marks(&mut self) {
        while matches!(self.queue.front(), Some(Segment::Mark)) {
            self.queue.pop_front();
        }
    }

    fn has_inband_before_mark(&self) -> bool {
        matches!(self.queue.front(), Some(Segment::Frame(_) | Segment::Data(_)))
    }
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    notify: Notify,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, segment: Segment) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(ClusterError::ConnectionClosed);
            }
            state.queue.push_back(segment);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn push_urgent(&self, bytes: &[u8]) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(ClusterError::ConnectionClosed);
            }
            state.urgent.extend(bytes);
            state.queue.push_back(Segment::Mark);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    fn try_recv(&self) -> Option<Result<Message>> {
        let mut state = self.lock();
        state.skip_marks();
        match state.queue.pop_front() {
            Some(Segment::Frame(message)) => Some(Ok(message)),
            Some(Segment::Data(bytes)) => Some(Err(ClusterError::protocol(format!(
                "{} raw bytes where a message was expected",
                bytes.len()
            )))),
            Some(Segment::Mark) | None if state.closed => Some(Err(ClusterError::ConnectionClosed)),
            Some(Segment::Mark) | None => None,
        }
    }

    fn is_readable(&self) -> bool {
        let state = self.lock();
        state.closed || state.queue.iter().any(|s| !matches!(s, Segment::Mark))
    }

    fn try_read(&self, buf: &mut [u8]) -> Option<Result<usize>> {
        let mut state = self.lock();
        state.skip_marks();
        let Some(segment) = state.queue.pop_front() else {
            return state.closed.then(|| Err(ClusterError::ConnectionClosed));
        };
        let mut bytes = match segment.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(e)),
        };
        let n = buf.len().min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        bytes.advance(n);
        if !bytes.is_empty() {
            state.queue.push_front(Segment::Data(bytes));
        }
        Some(Ok(n))
    }

    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        let state = self.lock();
        let mut copied = 0;
        for segment in state.queue.iter() {
            if matches!(segment, Segment::Mark) || copied == buf.len() {
                break;
            }
            let bytes = segment.to_bytes()?;
            let n = (buf.len() - copied).min(bytes.len());
            buf[copied..copied + n].copy_from_slice(&bytes[..n]);
            copied += n;
        }
        Ok(copied)
    }

    fn recv_urgent(&self, buf: &mut [u8]) -> Result<RawRead> {
        let mut state = self.lock();
        if state.urgent.is_empty() {
            return if state.closed {
                Err(ClusterError::ConnectionClosed)
            } else {
                Ok(RawRead::NotArrived)
            };
        }
        if state.has_inband_before_mark() {
            return Ok(RawRead::WouldBlock);
        }
        let Some(first) = buf.first_mut() else {
            return Ok(RawRead::Bytes(0));
        };
        match state.urgent.pop_front() {
            Some(byte) => {
                *first = byte;
                Ok(RawRead::Bytes(1))
            }
            None => Ok(RawRead::NotArrived),
        }
    }

    fn at_mark(&self) -> bool {
        matches!(self.lock().queue.front(), Some(Segment::Mark))
    }
}

/// One end of an in-process duplex channel created by [`pair`].
pub struct MemoryConnection {
    peer: String,
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    closed: bool,
}

/// Creates a connected pair. The first end reports `peer` as its peer
/// address (it is the master's handle on a worker called `peer`); the second
/// end reports `"master"`.
pub fn pair(peer: impl Into<String>) -> (MemoryConnection, MemoryConnection) {
    let to_worker = Arc::new(Pipe::default());
    let to_master = Arc::new(Pipe::default());

    let master_end = MemoryConnection {
        peer: peer.into(),
        incoming: Arc::clone(&to_master),
        outgoing: Arc::clone(&to_worker),
        closed: false,
    };
    let worker_end = MemoryConnection {
        peer: "master".to_string(),
        incoming: to_worker,
        outgoing: to_master,
        closed: false,
    };
    (master_end, worker_end)
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ClusterError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn shut(&mut self) {
        if !self.closed {
            self.closed = true;
            self.incoming.close();
            self.outgoing.close();
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.ensure_open()?;
        self.outgoing.push(Segment::Frame(message.clone()))
    }

    async fn recv(&mut self) -> Result<Message> {
        self.ensure_open()?;
        loop {
            if let Some(result) = self.incoming.try_recv() {
                return result;
            }
            self.incoming.notify.notified().await;
        }
    }

    async fn readable(&mut self) -> Result<()> {
        loop {
            if self.closed || self.incoming.is_readable() {
                return Ok(());
            }
            self.incoming.notify.notified().await;
        }
    }

    async fn send_raw(&mut self, bytes: &[u8], flag: RawFlag) -> Result<usize> {
        self.ensure_open()?;
        match flag {
            RawFlag::Normal => {
                self.outgoing.push(Segment::Data(Bytes::copy_from_slice(bytes)))?;
            }
            RawFlag::OutOfBand => self.outgoing.push_urgent(bytes)?,
            RawFlag::Peek => {
                return Err(ClusterError::protocol("peek is not a send mode"));
            }
        }
        Ok(bytes.len())
    }

    async fn recv_raw(&mut self, buf: &mut [u8], flag: RawFlag) -> Result<RawRead> {
        self.ensure_open()?;
        match flag {
            RawFlag::Normal => {
                if buf.is_empty() {
                    return Ok(RawRead::Bytes(0));
                }
                loop {
                    if let Some(result) = self.incoming.try_read(buf) {
                        return result.map(RawRead::Bytes);
                    }
                    self.incoming.notify.notified().await;
                }
            }
            RawFlag::Peek => self.incoming.peek(buf).map(RawRead::Bytes),
            RawFlag::OutOfBand => self.incoming.recv_urgent(buf),
        }
    }

    async fn at_mark(&mut self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.incoming.at_mark())
    }

    async fn close(&mut self) {
        self.shut();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::recv_raw_exact;

    #[tokio::test]
    async fn test_messages_and_raw_bytes_interleave_in_order() {
        let (mut master, mut worker) = pair("w0");

        worker.send(&Message::LogChunk { size: 5 }).await.unwrap();
        worker.send_raw(b"hello", RawFlag::Normal).await.unwrap();
        worker.send(&Message::Ping).await.unwrap();

        assert_eq!(master.recv().await.unwrap(), Message::LogChunk { size: 5 });
        let mut buf = [0u8; 5];
        recv_raw_exact(&mut master, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(master.recv().await.unwrap(), Message::Ping);
    }

    #[tokio::test]
    async fn test_urgent_byte_waits_for_inband_data_in_front() {
        let (mut master, mut worker) = pair("w0");
        let mut byte = [0u8; 1];

        assert_eq!(
            master.recv_raw(&mut byte, RawFlag::OutOfBand).await.unwrap(),
            RawRead::NotArrived
        );

        worker.send_raw(b"stale", RawFlag::Normal).await.unwrap();
        worker.send_raw(&[1], RawFlag::OutOfBand).await.unwrap();
        worker.send(&Message::LogDone { status: 0, parallel: 1 }).await.unwrap();

        assert_eq!(
            master.recv_raw(&mut byte, RawFlag::OutOfBand).await.unwrap(),
            RawRead::WouldBlock
        );

        let mut peek = [0u8; 64];
        assert_eq!(master.recv_raw(&mut peek, RawFlag::Peek).await.unwrap(), RawRead::Bytes(5));
        assert!(!master.at_mark().await.unwrap());
        let mut drain = [0u8; 64];
        assert_eq!(master.recv_raw(&mut drain, RawFlag::Normal).await.unwrap(), RawRead::Bytes(5));

        assert_eq!(
            master.recv_raw(&mut byte, RawFlag::OutOfBand).await.unwrap(),
            RawRead::Bytes(1)
        );
        assert_eq!(byte[0], 1);
        assert!(master.at_mark().await.unwrap());
        assert_eq!(master.recv().await.unwrap(), Message::LogDone { status: 0, parallel: 1 });
    }

    #[tokio::test]
    async fn test_readable_is_cancel_safe() {
        let (mut master, mut worker) = pair("w0");

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(10), master.readable()).await;
        assert!(timed_out.is_err());

        worker.send(&Message::Ping).await.unwrap();
        master.readable().await.unwrap();
        assert_eq!(master.recv().await.unwrap(), Message::Ping);
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (mut master, worker) = pair("w0");
        drop(worker);

        master.readable().await.unwrap();
        assert!(matches!(master.recv().await, Err(ClusterError::ConnectionClosed)));
        assert!(master.send(&Message::Ping).await.is_err());
    }
}
