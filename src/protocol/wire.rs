//! Bounds-checked little-endian field reader.

use super::ProtocolViolation;

pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        WireReader { buf }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolViolation> {
        if self.buf.len() < len {
            return Err(ProtocolViolation::Truncated {
                needed: len,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolViolation> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolViolation> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn bool(&mut self) -> Result<bool, ProtocolViolation> {
        Ok(self.u8()? != 0)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolViolation> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ProtocolViolation> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn u128(&mut self) -> Result<u128, ProtocolViolation> {
        Ok(u128::from_le_bytes(self.array()?))
    }

    /// Fail if any bytes are left.
    pub(crate) fn finish(&self) -> Result<(), ProtocolViolation> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolViolation::TrailingBytes(self.buf.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_fields_in_order() {
        let mut data = Vec::new();
        data.extend_from_slice(&7u32.to_le_bytes());
        data.push(1);
        data.extend_from_slice(&u128::MAX.to_le_bytes());
        let mut reader = WireReader::new(&data);
        assert_eq!(reader.u32().unwrap(), 7);
        assert!(reader.bool().unwrap());
        assert_eq!(reader.u128().unwrap(), u128::MAX);
        reader.finish().unwrap();
    }

    #[test]
    fn test_truncated() {
        let mut reader = WireReader::new(&[1, 2, 3]);
        assert_eq!(
            reader.u32(),
            Err(ProtocolViolation::Truncated {
                needed: 4,
                available: 3
            })
        );
    }
}
