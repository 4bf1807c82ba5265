// rust/cluster-core/src/transport/tcp.rs

//! TCP transport.
//!
//! Messages are length-prefixed bincode frames. Urgent bytes go through the
//! socket's out-of-band channel. The kernel records the position of the mark
//! in the in-band stream and [`Connection::at_mark`] asks for it with
//! `sockatmark`, so in-band content is never inspected.

use std::mem::MaybeUninit;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{decode_frame, encode_frame};
use crate::config::{ClusterConfig, ConnectConfig, WorkerEntry};
use crate::connection::{Connection, Connector, RawFlag, RawRead};
use crate::error::{ClusterError, Result};
use crate::protocol::Message;
use crate::registry::WorkerInfo;
use crate::retry::{is_transient_connect_error, retry_async, RetryConfig, RetryResult};
use crate::sink::BulkTransfer;

const READ_CHUNK: usize = 8 * 1024;

// POSIX `sockatmark(3)`; not bound by the `libc` crate on this target.
extern "C" {
    fn sockatmark(fd: libc::c_int) -> libc::c_int;
}

/// Framed message connection over a TCP stream.
pub struct TcpConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    max_frame_size: usize,
    peer: String,
    closed: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, max_frame_size: usize) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_size,
            peer,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ClusterError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// True when the next unread byte in the kernel buffer is the urgent mark.
    fn socket_at_mark(&self) -> Result<bool> {
        // SAFETY: the descriptor is owned by `self.stream` for the whole call.
        match unsafe { sockatmark(self.stream.as_raw_fd()) } {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(ClusterError::connection_with_source(
                format!("mark query on {} failed", self.peer),
                std::io::Error::last_os_error(),
            )),
        }
    }

    /// One socket read. A read that starts before the mark stops at it; one
    /// that starts at the mark steps over it.
    async fn fill(&mut self) -> Result<()> {
        self.read_buf.reserve(READ_CHUNK);
        let n = self
            .stream
            .read_buf(&mut self.read_buf)
            .await
            .map_err(|e| ClusterError::connection_with_source(format!("read from {} failed", self.peer), e))?;
        if n == 0 {
            return Err(ClusterError::ConnectionClosed);
        }
        Ok(())
    }

    /// Pulls whatever the socket already holds in front of the mark without
    /// waiting.
    fn fill_to_mark(&mut self) -> Result<()> {
        loop {
            if self.socket_at_mark()? {
                return Ok(());
            }
            self.read_buf.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    return Err(ClusterError::connection_with_source(
                        format!("read from {} failed", self.peer),
                        e,
                    ))
                }
            }
        }
    }

    fn recv_out_of_band(&self, buf: &mut [u8]) -> Result<RawRead> {
        let mut scratch = vec![MaybeUninit::<u8>::uninit(); buf.len()];
        match SockRef::from(&self.stream).recv_out_of_band(&mut scratch) {
            Ok(n) => {
                for (dst, src) in buf.iter_mut().zip(&scratch[..n]) {
                    // SAFETY: the first `n` bytes were initialized by recv.
                    *dst = unsafe { src.assume_init() };
                }
                Ok(RawRead::Bytes(n))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(RawRead::WouldBlock),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(RawRead::NotArrived),
            Err(e) => Err(ClusterError::connection_with_source(
                format!("out-of-band read from {} failed", self.peer),
                e,
            )),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.ensure_open()?;
        let frame = encode_frame(message)?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| ClusterError::connection_with_source(format!("write to {} failed", self.peer), e))
    }

    async fn recv(&mut self) -> Result<Message> {
        self.ensure_open()?;
        loop {
            if let Some(message) = decode_frame(&mut self.read_buf, self.max_frame_size)? {
                return Ok(message);
            }
            self.fill().await?;
        }
    }

    async fn readable(&mut self) -> Result<()> {
        if self.closed || !self.read_buf.is_empty() {
            return Ok(());
        }
        self.stream
            .readable()
            .await
            .map_err(|e| ClusterError::connection_with_source(format!("poll of {} failed", self.peer), e))
    }

    async fn send_raw(&mut self, bytes: &[u8], flag: RawFlag) -> Result<usize> {
        self.ensure_open()?;
        match flag {
            RawFlag::Normal => {
                self.stream.write_all(bytes).await.map_err(|e| {
                    ClusterError::connection_with_source(format!("write to {} failed", self.peer), e)
                })?;
                Ok(bytes.len())
            }
            RawFlag::OutOfBand => SockRef::from(&self.stream).send_out_of_band(bytes).map_err(|e| {
                ClusterError::connection_with_source(
                    format!("out-of-band write to {} failed", self.peer),
                    e,
                )
            }),
            RawFlag::Peek => Err(ClusterError::protocol("peek is not a send mode")),
        }
    }

    async fn recv_raw(&mut self, buf: &mut [u8], flag: RawFlag) -> Result<RawRead> {
        self.ensure_open()?;
        match flag {
            RawFlag::Normal => {
                if buf.is_empty() {
                    return Ok(RawRead::Bytes(0));
                }
                if self.read_buf.is_empty() {
                    self.fill().await?;
                }
                let n = self.read_buf.len().min(buf.len());
                buf[..n].copy_from_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                Ok(RawRead::Bytes(n))
            }
            RawFlag::Peek => {
                self.fill_to_mark()?;
                let n = self.read_buf.len().min(buf.len());
                buf[..n].copy_from_slice(&self.read_buf[..n]);
                Ok(RawRead::Bytes(n))
            }
            RawFlag::OutOfBand => self.recv_out_of_band(buf),
        }
    }

    async fn at_mark(&mut self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.read_buf.is_empty() && self.socket_at_mark()?)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn configure_socket(stream: &TcpStream, connect: &ConnectConfig) {
    if connect.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }
    if connect.keepalive {
        let sock = SockRef::from(stream);
        if let Err(e) = sock.set_tcp_keepalive(
            &socket2::TcpKeepalive::new()
                .with_time(std::time::Duration::from_secs(60))
                .with_interval(std::time::Duration::from_secs(10)),
        ) {
            warn!("Failed to set keepalive: {}", e);
        }
    }
}

async fn connect_with_retry(addr: &str, connect: &ConnectConfig) -> Result<TcpStream> {
    let retry = RetryConfig::from(connect);
    let timeout = connect.connect_timeout();

    let stream = retry_async(&retry, || async move {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => RetryResult::Ok(stream),
            Ok(Err(e)) if is_transient_connect_error(&e) => RetryResult::Retry(
                ClusterError::connection_with_source(format!("connect to {} failed", addr), e),
            ),
            Ok(Err(e)) => RetryResult::Fail(ClusterError::connection_with_source(
                format!("connect to {} failed", addr),
                e,
            )),
            Err(_) => RetryResult::Retry(ClusterError::connection(format!(
                "connect to {} timed out",
                addr
            ))),
        }
    })
    .await?;

    configure_socket(&stream, connect);
    Ok(stream)
}

/// Opens [`TcpConnection`]s to roster entries.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect: ConnectConfig,
    max_frame_size: usize,
}

impl TcpTransport {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            connect: config.connect.clone(),
            max_frame_size: config.transfer.max_frame_size,
        }
    }

    pub async fn connect(&self, entry: &WorkerEntry) -> Result<TcpConnection> {
        let addr = format!("{}:{}", entry.host, entry.port);
        let stream = connect_with_retry(&addr, &self.connect).await?;
        debug!("Connected to worker at {}", addr);
        Ok(TcpConnection::new(stream, self.max_frame_size))
    }
}

#[async_trait]
impl Connector for TcpTransport {
    async fn connect(&self, entry: &WorkerEntry) -> Result<Box<dyn Connection>> {
        let conn = TcpTransport::connect(self, entry).await?;
        Ok(Box::new(conn))
    }
}

/// Preamble of one bulk stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkHeader {
    pub remote_path: String,
    pub offset: u64,
    pub len: u64,
    pub total: u64,
}

/// Parallel-stream file upload to a worker's bulk port.
///
/// Each stream carries a length-prefixed bincode [`BulkHeader`], then exactly
/// `len` bytes of the file, and waits for a one-byte acknowledgement (zero on
/// success).
#[derive(Debug, Clone)]
pub struct TcpBulkTransfer {
    port: u16,
    block_size: usize,
    connect: ConnectConfig,
}

impl TcpBulkTransfer {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            port: config.session.bulk_port,
            block_size: config.transfer.file_block_size,
            connect: config.connect.clone(),
        }
    }

    async fn put_range(&self, addr: &str, source: &Path, header: BulkHeader) -> Result<u64> {
        let mut stream = connect_with_retry(addr, &self.connect).await?;
        let io_err = |e: std::io::Error| {
            ClusterError::connection_with_source(format!("bulk transfer to {} failed", addr), e)
        };

        let encoded = bincode::serialize(&header)?;
        let mut preamble = BytesMut::with_capacity(4 + encoded.len());
        preamble.put_u32(encoded.len() as u32);
        preamble.extend_from_slice(&encoded);
        stream.write_all(&preamble).await.map_err(io_err)?;

        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| ClusterError::io_with_source(source, "failed to open file", e))?;
        file.seek(std::io::SeekFrom::Start(header.offset))
            .await
            .map_err(|e| ClusterError::io_with_source(source, "failed to seek", e))?;

        let mut remaining = header.len;
        let mut block = vec![0u8; self.block_size];
        while remaining > 0 {
            let want = block.len().min(remaining as usize);
            let n = file
                .read(&mut block[..want])
                .await
                .map_err(|e| ClusterError::io_with_source(source, "failed to read", e))?;
            if n == 0 {
                return Err(ClusterError::io(source, "file shrank during transfer"));
            }
            stream.write_all(&block[..n]).await.map_err(io_err)?;
            remaining -= n as u64;
        }

        let ack = stream.read_u8().await.map_err(io_err)?;
        if ack != 0 {
            return Err(ClusterError::connection(format!(
                "bulk receiver at {} rejected {} (code {})",
                addr, header.remote_path, ack
            )));
        }
        Ok(header.len)
    }
}

/// Splits `total` bytes into at most `streams` contiguous ranges.
fn split_ranges(total: u64, streams: u32) -> Vec<(u64, u64)> {
    let streams = u64::from(streams.max(1)).min(total.max(1));
    let chunk = total.div_ceil(streams);
    (0..streams)
        .map(|i| {
            let offset = i * chunk;
            (offset, chunk.min(total.saturating_sub(offset)))
        })
        .filter(|&(_, len)| len > 0 || total == 0)
        .collect()
}

#[async_trait]
impl BulkTransfer for TcpBulkTransfer {
    async fn put(
        &mut self,
        target: &WorkerInfo,
        source: &Path,
        remote_path: &str,
        streams: u32,
    ) -> Result<u64> {
        let total = tokio::fs::metadata(source)
            .await
            .map_err(|e| ClusterError::io_with_source(source, "failed to stat file", e))?
            .len();
        let addr = format!("{}:{}", target.host, self.port);
        let streams = streams.max(1);

        let this = &*self;
        let addr = addr.as_str();
        let transfers = split_ranges(total, streams).into_iter().map(move |(offset, len)| {
            let header = BulkHeader {
                remote_path: remote_path.to_string(),
                offset,
                len,
                total,
            };
            async move { this.put_range(addr, source, header).await }
        });

        let sent: u64 = try_join_all(transfers).await?.into_iter().sum();
        info!(
            "Uploaded {} bytes of {} to {} ({})",
            sent,
            source.display(),
            target.host,
            remote_path
        );
        Ok(sent)
    }
}
