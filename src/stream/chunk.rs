//! Wire chunk: one bucket of a logical message as it travels on the wire.
//!
//! ```text
//! ┌────────────────────┬──────────────┬──────────────────┬─────────────────────────────┐
//! │ data_size: u64     │ token: u32   │ segment_count:u32│ segment_count × (u64, bytes)│
//! └────────────────────┴──────────────┴──────────────────┴─────────────────────────────┘
//! ```
//!
//! `token == 0` means the single segment is the raw payload.

use crate::codec::{Codec, CodecRegistry, CodecToken, SEGMENT_SIZE_MAX, TOKEN_NONE};
use crate::protocol::wire::WireReader;
use crate::protocol::ProtocolViolation;
use crate::stream::StreamError;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// Per-segment size prefix.
const SEGMENT_HEADER_SIZE: usize = 8;
/// data_size + token + segment count.
const CHUNK_HEADER_SIZE: usize = 16;
/// Upper bound on segments per chunk accepted from the wire.
pub const SEGMENT_COUNT_MAX: u32 = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    /// Uncompressed payload size
    pub data_size: u64,
    pub token: CodecToken,
    pub segments: Vec<Bytes>,
}

impl WireChunk {
    pub fn raw(data: &[u8]) -> Self {
        WireChunk {
            data_size: data.len() as u64,
            token: TOKEN_NONE,
            segments: vec![Bytes::copy_from_slice(data)],
        }
    }

    /// Compress `data` unless the result would not be smaller than the raw
    /// chunk, in which case the raw chunk is returned.
    pub fn encode_payload(codec: Option<&mut Box<dyn Codec>>, data: &[u8]) -> Self {
        let codec = match codec {
            Some(codec) if !data.is_empty() => codec,
            _ => return Self::raw(data),
        };

        let segments = match codec.compress(data) {
            Ok(segments) => segments,
            Err(e) => {
                warn!("{} compression failed, sending raw: {}", codec.name(), e);
                return Self::raw(data);
            }
        };

        let compressed_size: usize = segments.iter().map(|s| s.len() + SEGMENT_HEADER_SIZE).sum();
        if compressed_size >= data.len() + SEGMENT_HEADER_SIZE {
            return Self::raw(data);
        }

        WireChunk {
            data_size: data.len() as u64,
            token: codec.token(),
            segments: segments.into_iter().map(Bytes::from).collect(),
        }
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.token != TOKEN_NONE
    }

    /// Encoded size in bytes.
    pub fn wire_size(&self) -> usize {
        CHUNK_HEADER_SIZE
            + self
                .segments
                .iter()
                .map(|s| s.len() + SEGMENT_HEADER_SIZE)
                .sum::<usize>()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_size());
        buf.put_u64_le(self.data_size);
        buf.put_u32_le(self.token);
        buf.put_u32_le(self.segments.len() as u32);
        for segment in &self.segments {
            buf.put_u64_le(segment.len() as u64);
            buf.put_slice(segment);
        }
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolViolation> {
        let data_size = reader.u64()?;
        let token = reader.u32()?;
        let count = reader.u32()?;
        if count > SEGMENT_COUNT_MAX {
            return Err(ProtocolViolation::MalformedChunk(format!(
                "{} segments exceeds {}",
                count, SEGMENT_COUNT_MAX
            )));
        }

        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = reader.u64()?;
            if len > reader.remaining() as u64 {
                return Err(ProtocolViolation::Truncated {
                    needed: len as usize,
                    available: reader.remaining(),
                });
            }
            segments.push(Bytes::copy_from_slice(reader.bytes(len as usize)?));
        }

        let chunk = WireChunk {
            data_size,
            token,
            segments,
        };
        chunk.validate()?;
        Ok(chunk)
    }

    fn validate(&self) -> Result<(), ProtocolViolation> {
        if self.token == TOKEN_NONE {
            if self.segments.len() != 1 {
                return Err(ProtocolViolation::MalformedChunk(format!(
                    "raw chunk with {} segments",
                    self.segments.len()
                )));
            }
            if self.segments[0].len() as u64 != self.data_size {
                return Err(ProtocolViolation::MalformedChunk(format!(
                    "raw chunk of {} bytes declares {}",
                    self.segments[0].len(),
                    self.data_size
                )));
            }
        } else if self.segments.is_empty() {
            return Err(ProtocolViolation::MalformedChunk(
                "compressed chunk without segments".to_string(),
            ));
        } else {
            // Each segment decodes to at most SEGMENT_SIZE_MAX bytes.
            let limit = self.segments.len() as u64 * SEGMENT_SIZE_MAX as u64;
            if self.data_size > limit {
                return Err(ProtocolViolation::MalformedChunk(format!(
                    "compressed chunk of {} segments declares {} bytes",
                    self.segments.len(),
                    self.data_size
                )));
            }
        }
        Ok(())
    }

    /// Reconstruct the payload with one decode call.
    pub fn payload(&self, registry: &CodecRegistry) -> Result<Bytes, StreamError> {
        if self.token == TOKEN_NONE {
            return Ok(self.segments[0].clone());
        }
        let mut codec = registry.by_token(self.token)?;
        let refs: Vec<&[u8]> = self.segments.iter().map(|s| s.as_ref()).collect();
        let data = codec.decompress(&refs, self.data_size as usize)?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, RleCodec, TOKEN_RLE};

    fn reencode(chunk: &WireChunk) -> WireChunk {
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        assert_eq!(buf.len(), chunk.wire_size());
        let mut reader = WireReader::new(&buf);
        let decoded = WireChunk::decode(&mut reader).unwrap();
        reader.finish().unwrap();
        decoded
    }

    #[test]
    fn test_compressible_payload_uses_codec() {
        let data = vec![0u8; 4096];
        let mut codec: Box<dyn Codec> = Box::new(RleCodec::new());
        let chunk = WireChunk::encode_payload(Some(&mut codec), &data);
        assert_eq!(chunk.token, TOKEN_RLE);
        let decoded = reencode(&chunk);
        assert_eq!(decoded.payload(&CodecRegistry::builtin()).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_is_raw() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut codec: Box<dyn Codec> = Box::new(RleCodec::new());
        let chunk = WireChunk::encode_payload(Some(&mut codec), &data);
        assert_eq!(chunk.token, TOKEN_NONE);
        assert_eq!(chunk.segments[0].as_ref(), data.as_slice());
    }

    #[test]
    fn test_raw_chunk_size_mismatch_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(10);
        buf.put_u32_le(TOKEN_NONE);
        buf.put_u32_le(1);
        buf.put_u64_le(3);
        buf.put_slice(b"abc");
        let mut reader = WireReader::new(&buf);
        assert!(matches!(
            WireChunk::decode(&mut reader),
            Err(ProtocolViolation::MalformedChunk(_))
        ));
    }

    #[test]
    fn test_oversized_compressed_chunk_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(u64::MAX);
        buf.put_u32_le(TOKEN_RLE);
        buf.put_u32_le(1);
        buf.put_u64_le(2);
        buf.put_slice(&[0, 7]);
        let mut reader = WireReader::new(&buf);
        assert!(matches!(
            WireChunk::decode(&mut reader),
            Err(ProtocolViolation::MalformedChunk(_))
        ));

        // Within the segment bound but larger than the segment expands to.
        let chunk = WireChunk {
            data_size: SEGMENT_SIZE_MAX as u64,
            token: TOKEN_RLE,
            segments: vec![Bytes::from_static(&[0, 7])],
        };
        assert!(matches!(
            chunk.payload(&CodecRegistry::builtin()),
            Err(StreamError::Codec(CodecError::SizeMismatch { .. }))
        ));
    }

    #[test]
    fn test_unknown_token_payload() {
        let chunk = WireChunk {
            data_size: 1,
            token: 77,
            segments: vec![Bytes::from_static(b"x")],
        };
        assert!(matches!(
            chunk.payload(&CodecRegistry::builtin()),
            Err(StreamError::Codec(CodecError::UnknownToken(77)))
        ));
    }
}
