// rust/cluster-core/src/transport/mod.rs

//! Concrete [`Connection`](crate::connection::Connection) implementations.
//!
//! Both transports share the same framing: a `u32` big-endian payload length
//! followed by the bincode-encoded [`Message`]. An urgent byte sent on the
//! out-of-band channel leaves a mark in the in-band stream where the
//! receiver's flush must stop.

pub mod memory;
pub mod tcp;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ClusterError, Result};
use crate::protocol::Message;

pub use memory::{pair, MemoryConnection};
pub use tcp::{TcpBulkTransfer, TcpConnection, TcpTransport};

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

pub fn encode_frame(message: &Message) -> Result<Bytes> {
    let payload = bincode::serialize(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ClusterError::protocol("message too large to frame"))?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes one frame from the front of `buf`, or returns `None` when the
/// frame is not complete yet.
pub fn decode_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Message>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_frame_size {
        return Err(ClusterError::protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_size
        )));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(len);
    Ok(Some(bincode::deserialize(&payload)?))
}
