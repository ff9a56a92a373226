//! Plain message framing for streaming directly over a connection.
//!
//! ```text
//! ┌──────────────────┬──────────┬─────────────┐
//! │ frame_size: u64  │ last: u8 │ WireChunk   │
//! └──────────────────┴──────────┴─────────────┘
//! ```

use super::{BucketSource, ChunkFramer, StreamError, WireChunk};
use crate::codec::CodecRegistry;
use crate::connection::ConnectionHandle;
use crate::protocol::wire::WireReader;
use crate::protocol::ProtocolViolation;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Largest frame accepted by [`read_frame`].
pub const FRAME_SIZE_MAX: u64 = 256 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 9;

#[derive(Debug, Default)]
pub struct PlainFramer;

impl PlainFramer {
    pub fn new() -> Self {
        PlainFramer
    }
}

impl ChunkFramer for PlainFramer {
    fn frame(&mut self, chunk: &WireChunk, last: bool) -> Bytes {
        let size = FRAME_HEADER_SIZE + chunk.wire_size();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u64_le(size as u64);
        buf.put_u8(last as u8);
        chunk.encode(&mut buf);
        buf.freeze()
    }
}

/// Read one frame, blocking until it has fully arrived.
pub fn read_frame(connection: &ConnectionHandle) -> Result<(WireChunk, bool), StreamError> {
    let mut size_bytes = [0u8; 8];
    connection.recv(&mut size_bytes)?;
    let size = u64::from_le_bytes(size_bytes);
    if size < FRAME_HEADER_SIZE as u64 || size > FRAME_SIZE_MAX {
        return Err(ProtocolViolation::BadPacketSize {
            size,
            max: FRAME_SIZE_MAX,
        }
        .into());
    }

    let mut body = vec![0u8; size as usize - 8];
    connection.recv(&mut body)?;
    let mut reader = WireReader::new(&body);
    let last = reader.bool()?;
    let chunk = WireChunk::decode(&mut reader)?;
    reader.finish()?;
    Ok((chunk, last))
}

/// Buckets read from a connection until the frame flagged `last`.
pub struct ConnectionSource {
    connection: ConnectionHandle,
    registry: Arc<CodecRegistry>,
    done: bool,
}

impl ConnectionSource {
    pub fn new(connection: ConnectionHandle, registry: Arc<CodecRegistry>) -> Self {
        ConnectionSource {
            connection,
            registry,
            done: false,
        }
    }
}

impl BucketSource for ConnectionSource {
    fn next_bucket(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.done {
            return Ok(None);
        }
        let (chunk, last) = read_frame(&self.connection)?;
        self.done = last;
        Ok(Some(chunk.payload(&self.registry)?))
    }
}
