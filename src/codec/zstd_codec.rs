//! Zstd codec (requires the `compression` feature).

use super::{Codec, CodecError, CodecToken, SEGMENT_SIZE_MAX, TOKEN_ZSTD};

#[derive(Debug)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        ZstdCodec { level }
    }
}

impl Codec for ZstdCodec {
    fn token(&self) -> CodecToken {
        TOKEN_ZSTD
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&mut self, input: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        input
            .chunks(SEGMENT_SIZE_MAX)
            .map(|segment| {
                zstd::encode_all(segment, self.level).map_err(|e| CodecError::Corrupt(e.to_string()))
            })
            .collect()
    }

    fn decompress(
        &mut self,
        segments: &[&[u8]],
        uncompressed_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(uncompressed_size.min(segments.len() * SEGMENT_SIZE_MAX));
        for segment in segments {
            let decoded =
                zstd::decode_all(*segment).map_err(|e| CodecError::Corrupt(e.to_string()))?;
            out.extend_from_slice(&decoded);
            if out.len() > uncompressed_size {
                break;
            }
        }
        if out.len() != uncompressed_size {
            return Err(CodecError::SizeMismatch {
                expected: uncompressed_size,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let input: Vec<u8> = b"replicated object state ".repeat(5000);
        let mut codec = ZstdCodec::new(3);
        let segments = codec.compress(&input).unwrap();
        assert!(segments.len() > 1);
        let refs: Vec<&[u8]> = segments.iter().map(|s| s.as_slice()).collect();
        assert_eq!(codec.decompress(&refs, input.len()).unwrap(), input);
    }
}
