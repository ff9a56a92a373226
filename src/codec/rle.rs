//! Byte-oriented run-length codec (PackBits layout).
//!
//! Each control byte `c` is followed by either `c + 1` literal bytes
//! (`c <= 127`) or one byte repeated `257 - c` times (`c >= 129`). Input is
//! split into segments of at most [`SEGMENT_SIZE_MAX`] bytes that decode
//! independently.

use super::{Codec, CodecError, CodecToken, SEGMENT_SIZE_MAX, TOKEN_RLE};

const RUN_MAX: usize = 128;
const LITERAL_MAX: usize = 128;

#[derive(Debug, Default)]
pub struct RleCodec;

impl RleCodec {
    pub fn new() -> Self {
        RleCodec
    }

    fn encode_segment(input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() / 2 + 2);
        let mut i = 0;
        while i < input.len() {
            let byte = input[i];
            let mut run = 1;
            while i + run < input.len() && input[i + run] == byte && run < RUN_MAX {
                run += 1;
            }

            if run >= 3 {
                out.push((257 - run) as u8);
                out.push(byte);
                i += run;
                continue;
            }

            // Literal stretch up to the next run of three.
            let start = i;
            while i < input.len() && i - start < LITERAL_MAX {
                if i + 2 < input.len() && input[i] == input[i + 1] && input[i] == input[i + 2] {
                    break;
                }
                i += 1;
            }
            out.push((i - start - 1) as u8);
            out.extend_from_slice(&input[start..i]);
        }
        out
    }

    fn decode_segment(input: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut i = 0;
        while i < input.len() {
            let control = input[i] as usize;
            i += 1;
            if control <= 127 {
                let len = control + 1;
                let literal = input
                    .get(i..i + len)
                    .ok_or_else(|| CodecError::Corrupt("truncated literal".to_string()))?;
                out.extend_from_slice(literal);
                i += len;
            } else if control >= 129 {
                let byte = *input
                    .get(i)
                    .ok_or_else(|| CodecError::Corrupt("truncated run".to_string()))?;
                out.resize(out.len() + (257 - control), byte);
                i += 1;
            }
        }
        Ok(())
    }
}

impl Codec for RleCodec {
    fn token(&self) -> CodecToken {
        TOKEN_RLE
    }

    fn name(&self) -> &'static str {
        "rle"
    }

    fn compress(&mut self, input: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        Ok(input.chunks(SEGMENT_SIZE_MAX).map(Self::encode_segment).collect())
    }

    fn decompress(
        &mut self,
        segments: &[&[u8]],
        uncompressed_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(uncompressed_size.min(segments.len() * SEGMENT_SIZE_MAX));
        for segment in segments {
            Self::decode_segment(segment, &mut out)?;
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

    fn roundtrip(input: &[u8]) -> Vec<Vec<u8>> {
        let mut codec = RleCodec::new();
        let segments = codec.compress(input).unwrap();
        let refs: Vec<&[u8]> = segments.iter().map(|s| s.as_slice()).collect();
        assert_eq!(codec.decompress(&refs, input.len()).unwrap(), input);
        segments
    }

    #[test]
    fn test_declared_size_does_not_drive_allocation() {
        let mut codec = RleCodec::new();
        let result = codec.decompress(&[&[0, 7]], usize::MAX);
        assert!(matches!(
            result,
            Err(CodecError::SizeMismatch { expected: usize::MAX, actual: 1 })
        ));
    }

    #[test]
    fn test_runs_compress() {
        let input = vec![7u8; 10_000];
        let segments = roundtrip(&input);
        let total: usize = segments.iter().map(|s| s.len()).sum();
        assert!(total < 200, "runs should collapse, got {} bytes", total);
    }

    #[test]
    fn test_mixed_content() {
        let mut input = b"abcdefg".to_vec();
        input.extend(std::iter::repeat(0u8).take(300));
        input.extend_from_slice(b"xyzzy");
        input.extend_from_slice(&[1, 1, 2, 2, 3, 3, 3]);
        roundtrip(&input);
        roundtrip(&[]);
        roundtrip(&[42]);
    }

    #[test]
    fn test_large_input_is_segmented() {
        let input: Vec<u8> = (0..(SEGMENT_SIZE_MAX * 2 + 10)).map(|i| (i / 7) as u8).collect();
        let segments = roundtrip(&input);
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        let mut codec = RleCodec::new();
        let result = codec.decompress(&[&[5u8, 1, 2]], 6);
        assert!(matches!(result, Err(CodecError::Corrupt(_))));
    }
}
