//! Output stream.
//!
//! A logical message is framed by `enable()` and `disable()`. Between the
//! two, every target connection's send gate is held so chunks of this
//! message are never interleaved with other traffic on the same connection.
//! With saving enabled the written bytes are retained after `disable()` and
//! can be sent again with `resend()` to receivers that join later.

use super::{StreamError, WireChunk};
use crate::codec::{Codec, CompressionPolicy};
use crate::connection::ConnectionHandle;
use bytes::Bytes;
use serde::Serialize;
use std::io;
use tracing::{trace, warn};

/// Buffered bytes that trigger a non-final chunk.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 60_000;

/// Wraps wire chunks into complete packets.
pub trait ChunkFramer: Send {
    /// A new logical message starts.
    fn reset(&mut self) {}

    /// Build the packet carrying `chunk`; `last` marks the final chunk.
    fn frame(&mut self, chunk: &WireChunk, last: bool) -> Bytes;
}

pub struct DataOStream {
    framer: Box<dyn ChunkFramer>,
    buffer: Vec<u8>,
    /// Bytes before this offset were already sent (kept only when saving).
    buffer_start: usize,
    codec: Option<Box<dyn Codec>>,
    policy: CompressionPolicy,
    compress_active: bool,
    connections: Vec<ConnectionHandle>,
    flush_threshold: usize,
    enabled: bool,
    data_sent: bool,
    save: bool,
    /// Whole saved buffer as one chunk, keyed by whether it was compressed.
    complete: Option<(bool, WireChunk)>,
}

impl DataOStream {
    pub fn new(framer: Box<dyn ChunkFramer>) -> Self {
        DataOStream {
            framer,
            buffer: Vec::new(),
            buffer_start: 0,
            codec: None,
            policy: CompressionPolicy::default(),
            compress_active: false,
            connections: Vec::new(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            enabled: false,
            data_sent: false,
            save: false,
            complete: None,
        }
    }

    pub fn with_codec(mut self, codec: Option<Box<dyn Codec>>, policy: CompressionPolicy) -> Self {
        self.codec = codec;
        self.policy = policy;
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Access the framer, e.g. to retarget a saved message before `resend`.
    pub fn framer_mut(&mut self) -> &mut dyn ChunkFramer {
        self.framer.as_mut()
    }

    pub fn enable_save(&mut self) {
        self.save = true;
    }

    pub fn disable_save(&mut self) {
        self.save = false;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True once any payload was produced for the current message.
    #[inline]
    pub fn has_sent_data(&self) -> bool {
        self.data_sent
    }

    /// Bytes retained by a saving stream.
    pub fn saved_data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Start a message to `connections`, taking each one's send gate.
    pub fn enable(&mut self, connections: &[ConnectionHandle]) {
        debug_assert!(!self.enabled, "stream enabled twice");
        self.connections = lock_targets(connections);
        self.compress_active = self.wants_compression(&self.connections);
        self.buffer.clear();
        self.buffer_start = 0;
        self.complete = None;
        self.data_sent = false;
        self.enabled = true;
        self.framer.reset();
    }

    fn wants_compression(&self, connections: &[ConnectionHandle]) -> bool {
        self.codec.is_some()
            && !connections.is_empty()
            && connections
                .iter()
                .all(|c| self.policy.should_compress(&c.description()))
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if !self.enabled {
            return Err(StreamError::NotEnabled);
        }
        self.buffer.extend_from_slice(data);
        self.complete = None;
        if self.buffer.len() - self.buffer_start > self.flush_threshold {
            self.flush();
        }
        Ok(())
    }

    /// Send buffered bytes as a non-final chunk.
    fn flush(&mut self) {
        if !self.connections.is_empty() {
            self.send_range(self.buffer_start, self.buffer.len(), false);
        }
        self.data_sent = true;
        self.reset_start();
    }

    fn reset_start(&mut self) {
        if self.save {
            self.buffer_start = self.buffer.len();
        } else {
            self.buffer.clear();
            self.buffer_start = 0;
        }
    }

    /// Finish the message: send the final chunk and release the send gates.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        let pending = self.buffer.len() - self.buffer_start;
        if self.data_sent {
            if !self.connections.is_empty() {
                self.send_range(self.buffer_start, self.buffer.len(), true);
            }
        } else if pending > 0 {
            if !self.connections.is_empty() {
                self.send_range(self.buffer_start, self.buffer.len(), true);
            }
            self.data_sent = true;
        }
        self.reset_start();
        self.finish();
    }

    fn finish(&mut self) {
        unlock_targets(&self.connections);
        self.connections.clear();
        self.enabled = false;
        if !self.save {
            self.buffer.clear();
            self.buffer_start = 0;
        }
    }

    /// Enable, send `data` as one final chunk and disable.
    pub fn write_once(&mut self, connections: &[ConnectionHandle], data: &[u8]) {
        self.enable(connections);
        if !data.is_empty() {
            if !self.connections.is_empty() {
                let chunk = self.encode(data, self.compress_active);
                self.send_chunk(&chunk, true);
            }
            self.data_sent = true;
        }
        if self.save {
            self.buffer.extend_from_slice(data);
            self.buffer_start = self.buffer.len();
        }
        self.finish();
    }

    /// Send the saved message again, as a single final chunk.
    pub fn resend(&mut self, connections: &[ConnectionHandle]) {
        debug_assert!(self.save, "resend on a stream without saved data");
        debug_assert!(!self.enabled, "resend while a message is in progress");

        let targets = lock_targets(connections);
        if !targets.is_empty() {
            let compress = self.wants_compression(&targets);
            let chunk = match self.complete.take() {
                Some((cached, chunk)) if cached == compress => chunk,
                _ => {
                    let buffer = std::mem::take(&mut self.buffer);
                    let chunk = self.encode(&buffer, compress);
                    self.buffer = buffer;
                    chunk
                }
            };

            self.framer.reset();
            let packet = self.framer.frame(&chunk, true);
            for connection in &targets {
                if let Err(e) = connection.send(&packet, true) {
                    warn!("resend to connection {} failed: {}", connection.id(), e);
                }
            }
            self.complete = Some((compress, chunk));
        }
        unlock_targets(&targets);
    }

    /// Drop all buffered and saved bytes.
    pub fn reset(&mut self) {
        if self.enabled {
            self.finish();
        }
        self.buffer.clear();
        self.buffer_start = 0;
        self.complete = None;
        self.data_sent = false;
    }

    fn encode(&mut self, data: &[u8], compress: bool) -> WireChunk {
        let codec = if compress { self.codec.as_mut() } else { None };
        WireChunk::encode_payload(codec, data)
    }

    fn send_range(&mut self, start: usize, end: usize, last: bool) {
        let data = std::mem::take(&mut self.buffer);
        let chunk = self.encode(&data[start..end], self.compress_active);
        self.buffer = data;
        self.send_chunk(&chunk, last);
    }

    fn send_chunk(&mut self, chunk: &WireChunk, last: bool) {
        let packet = self.framer.frame(chunk, last);
        trace!(
            "sending chunk of {} bytes (token {}, last {}) to {} connections",
            chunk.data_size,
            chunk.token,
            last,
            self.connections.len()
        );

        let mut failed = Vec::new();
        for (index, connection) in self.connections.iter().enumerate() {
            if let Err(e) = connection.send(&packet, true) {
                warn!("send to connection {} failed: {}", connection.id(), e);
                failed.push(index);
            }
        }
        for index in failed.into_iter().rev() {
            let connection = self.connections.remove(index);
            connection.unlock_send();
        }
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), StreamError> {
        self.write(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), StreamError> {
        self.write(&[value as u8])
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), StreamError> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), StreamError> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u128(&mut self, value: u128) -> Result<(), StreamError> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), StreamError> {
        self.write(&value.to_le_bytes())
    }

    /// Length-prefixed byte string.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_u64(data.len() as u64)?;
        self.write(data)
    }

    pub fn write_str(&mut self, value: &str) -> Result<(), StreamError> {
        self.write_bytes(value.as_bytes())
    }

    /// Any serde value, bincode-encoded.
    pub fn write_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), StreamError> {
        bincode::serialize_into(&mut *self, value)?;
        Ok(())
    }
}

impl io::Write for DataOStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        DataOStream::write(self, buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DataOStream {
    fn drop(&mut self) {
        if self.enabled {
            unlock_targets(&self.connections);
        }
    }
}

/// Deduplicate by id, lock in id order.
fn lock_targets(connections: &[ConnectionHandle]) -> Vec<ConnectionHandle> {
    let mut targets: Vec<ConnectionHandle> = connections.to_vec();
    targets.sort_by_key(|c| c.id());
    targets.dedup_by_key(|c| c.id());
    for connection in &targets {
        connection.lock_send();
    }
    targets
}

fn unlock_targets(connections: &[ConnectionHandle]) {
    for connection in connections {
        connection.unlock_send();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, CodecRegistry, CodecToken, RleCodec, TOKEN_NONE, TOKEN_RLE};
    use crate::connection::Connection;
    use crate::stream::{read_frame, DataIStream, PlainFramer};

    /// Always expands its input by 10%.
    struct ExpandingCodec;

    impl Codec for ExpandingCodec {
        fn token(&self) -> CodecToken {
            0x7e57
        }
        fn name(&self) -> &'static str {
            "expanding"
        }
        fn compress(&mut self, input: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
            let mut out = input.to_vec();
            out.extend(std::iter::repeat(0u8).take(input.len() / 10));
            Ok(vec![out])
        }
        fn decompress(&mut self, _: &[&[u8]], _: usize) -> Result<Vec<u8>, CodecError> {
            unreachable!("never selected for the wire")
        }
    }

    fn plain_stream() -> DataOStream {
        DataOStream::new(Box::new(PlainFramer::new()))
    }

    #[test]
    fn test_write_once_rejects_expanding_codec() {
        let (tx, rx) = Connection::pair().unwrap();
        let mut os = plain_stream()
            .with_codec(Some(Box::new(ExpandingCodec)), CompressionPolicy::ALWAYS);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();

        os.write_once(&[tx], &payload);
        assert!(os.has_sent_data());

        let (chunk, last) = read_frame(&rx).unwrap();
        assert!(last);
        assert_eq!(chunk.token, TOKEN_NONE);
        assert_eq!(chunk.segments.len(), 1);
        assert_eq!(chunk.segments[0].len(), 1000);
        assert_eq!(chunk.segments[0].as_ref(), payload.as_slice());
    }

    #[test]
    fn test_flush_splits_message_into_chunks() {
        let (tx, rx) = Connection::pair().unwrap();
        let mut os = plain_stream().with_flush_threshold(100);
        os.enable(&[tx]);
        for i in 0..10u8 {
            os.write(&[i; 60]).unwrap();
        }
        os.disable();

        let mut total = 0;
        let mut chunks = 0;
        loop {
            let (chunk, last) = read_frame(&rx).unwrap();
            total += chunk.data_size;
            chunks += 1;
            if last {
                break;
            }
        }
        assert_eq!(total, 600);
        assert!(chunks > 1);
    }

    #[test]
    fn test_empty_message_sends_nothing() {
        let (tx, _rx) = Connection::pair().unwrap();
        let mut os = plain_stream();
        os.enable(&[tx.clone()]);
        os.disable();
        assert!(!os.has_sent_data());
        // Gate released: an unlocked send does not block.
        tx.send(b"ok", false).unwrap();
    }

    #[test]
    fn test_compression_follows_policy() {
        let (tx, rx) = Connection::pair().unwrap();
        let data = vec![3u8; 5000];

        let mut os = plain_stream()
            .with_codec(Some(Box::new(RleCodec::new())), CompressionPolicy::default());
        os.write_once(&[tx.clone()], &data);
        let (chunk, _) = read_frame(&rx).unwrap();
        assert_eq!(chunk.token, TOKEN_NONE, "pair links are above the threshold");

        let mut os = plain_stream()
            .with_codec(Some(Box::new(RleCodec::new())), CompressionPolicy::ALWAYS);
        os.write_once(&[tx], &data);
        let (chunk, _) = read_frame(&rx).unwrap();
        assert_eq!(chunk.token, TOKEN_RLE);
        assert_eq!(chunk.payload(&CodecRegistry::builtin()).unwrap(), data);
    }

    #[test]
    fn test_saved_stream_resend_to_late_receiver() {
        let (tx1, rx1) = Connection::pair().unwrap();
        let (tx2, rx2) = Connection::pair().unwrap();

        let mut os = plain_stream().with_flush_threshold(16);
        os.enable_save();
        os.enable(&[tx1]);
        os.write_str("first receiver sees this in pieces").unwrap();
        os.write_u32(42).unwrap();
        os.disable();

        let mut first = DataIStream::new(Box::new(crate::stream::ConnectionSource::new(
            rx1,
            std::sync::Arc::new(CodecRegistry::builtin()),
        )));
        assert_eq!(first.read_string().unwrap(), "first receiver sees this in pieces");
        assert_eq!(first.read_u32().unwrap(), 42);

        os.resend(&[tx2]);
        let (chunk, last) = read_frame(&rx2).unwrap();
        assert!(last);
        assert_eq!(chunk.data_size as usize, os.saved_data().len());

        let mut late = DataIStream::from_buckets(vec![chunk
            .payload(&CodecRegistry::builtin())
            .unwrap()]);
        assert_eq!(late.read_string().unwrap(), "first receiver sees this in pieces");
        assert_eq!(late.read_u32().unwrap(), 42);
    }

    #[test]
    fn test_write_requires_enable() {
        let mut os = plain_stream();
        assert!(matches!(os.write(b"x"), Err(StreamError::NotEnabled)));
    }

    #[test]
    fn test_duplicate_targets_receive_once() {
        let (tx, rx) = Connection::pair().unwrap();
        let mut os = plain_stream();
        os.write_once(&[tx.clone(), tx.clone()], b"once");
        let (chunk, _) = read_frame(&rx).unwrap();
        assert_eq!(chunk.segments[0].as_ref(), b"once");

        tx.close();
        assert!(read_frame(&rx).is_err());
    }
}
