//! Input stream over a sequence of buckets.

use super::StreamError;
use bytes::{Buf, Bytes};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::io;
use tracing::error;

/// Supplies the buckets of one logical message, in order.
pub trait BucketSource: Send {
    /// Next bucket, or `None` after the last one.
    fn next_bucket(&mut self) -> Result<Option<Bytes>, StreamError>;
}

/// Buckets already in memory.
#[derive(Debug, Default)]
pub struct VecSource {
    buckets: VecDeque<Bytes>,
}

impl VecSource {
    pub fn new(buckets: Vec<Bytes>) -> Self {
        VecSource {
            buckets: buckets.into(),
        }
    }
}

impl BucketSource for VecSource {
    fn next_bucket(&mut self) -> Result<Option<Bytes>, StreamError> {
        Ok(self.buckets.pop_front())
    }
}

/// Forward-only reader. A failed read leaves the stream unusable.
pub struct DataIStream {
    source: Box<dyn BucketSource>,
    current: Bytes,
    consumed: u64,
}

impl DataIStream {
    pub fn new(source: Box<dyn BucketSource>) -> Self {
        DataIStream {
            source,
            current: Bytes::new(),
            consumed: 0,
        }
    }

    pub fn from_buckets(buckets: Vec<Bytes>) -> Self {
        Self::new(Box::new(VecSource::new(buckets)))
    }

    /// Advance to a non-empty bucket. Returns false after the last one.
    fn fill(&mut self) -> Result<bool, StreamError> {
        while self.current.is_empty() {
            match self.source.next_bucket()? {
                Some(bucket) => self.current = bucket,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Fill `dest` completely.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<(), StreamError> {
        let mut copied = 0;
        while copied < dest.len() {
            if !self.fill()? {
                error!(
                    "read of {} bytes past end of stream after {} bytes",
                    dest.len(),
                    self.consumed
                );
                return Err(StreamError::ReadPastEnd {
                    requested: dest.len(),
                    available: copied,
                });
            }
            let n = (dest.len() - copied).min(self.current.len());
            self.current.copy_to_slice(&mut dest[copied..copied + n]);
            copied += n;
            self.consumed += n as u64;
        }
        Ok(())
    }

    /// Bytes left in the bucket currently being read.
    pub fn remaining_in_bucket(&self) -> usize {
        self.current.len()
    }

    /// Total bytes read so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// True when no bytes remain in this or any later bucket.
    pub fn is_exhausted(&mut self) -> Result<bool, StreamError> {
        Ok(!self.fill()?)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], StreamError> {
        let mut out = [0u8; N];
        self.read(&mut out)?;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, StreamError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, StreamError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn read_u128(&mut self) -> Result<u128, StreamError> {
        Ok(u128::from_le_bytes(self.array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, StreamError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, StreamError> {
        let len = self.read_u64()? as usize;
        let mut out = vec![0u8; len];
        self.read(&mut out)?;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String, StreamError> {
        Ok(String::from_utf8(self.read_bytes()?)?)
    }

    /// A bincode-encoded serde value.
    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T, StreamError> {
        Ok(bincode::deserialize_from(&mut *self)?)
    }
}

impl io::Read for DataIStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self
            .fill()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if !available || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.current.len());
        self.current.copy_to_slice(&mut buf[..n]);
        self.consumed += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[test]
    fn test_read_spans_buckets() {
        let mut is = DataIStream::from_buckets(vec![
            Bytes::from_static(&[1, 2]),
            Bytes::new(),
            Bytes::from_static(&[3, 4, 5]),
        ]);
        let mut out = [0u8; 4];
        is.read(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(is.remaining_in_bucket(), 1);
        assert_eq!(is.read_u8().unwrap(), 5);
        assert!(is.is_exhausted().unwrap());
    }

    #[test]
    fn test_read_past_end() {
        let mut is = DataIStream::from_buckets(vec![Bytes::from_static(&[1, 2])]);
        let err = is.read_u32().unwrap_err();
        assert!(matches!(
            err,
            StreamError::ReadPastEnd {
                requested: 4,
                available: 2
            }
        ));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Frame {
        number: u64,
        camera: [f32; 3],
        label: String,
    }

    #[test]
    fn test_serde_values_across_buckets() {
        let frame = Frame {
            number: 7,
            camera: [1.0, 2.5, -3.0],
            label: "left eye".to_string(),
        };
        let encoded = bincode::serialize(&frame).unwrap();
        let (a, b) = encoded.split_at(5);
        let mut is = DataIStream::from_buckets(vec![
            Bytes::copy_from_slice(a),
            Bytes::copy_from_slice(b),
        ]);
        let decoded: Frame = is.read_value().unwrap();
        assert_eq!(decoded, frame);
    }
}
