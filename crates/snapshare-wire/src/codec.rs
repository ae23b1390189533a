//! Bounds-checked body reader and length-prefixed string helpers

use bytes::{BufMut, Bytes};
use snapshare_core::{ShareError, ShareResult};

/// Cursor over a packet body; every read is bounds-checked
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> ShareResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ShareError::BufferTooShort {
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> ShareResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> ShareResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u64(&mut self) -> ShareResult<u64> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(out))
    }

    pub fn array<const N: usize>(&mut self) -> ShareResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// u8 length prefix followed by UTF-8
    pub fn short_str(&mut self) -> ShareResult<String> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ShareError::InvalidWireFormat("String is not UTF-8".into()))
    }

    /// Everything left in the body
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Everything left, as a zero-copy slice of `backing`.
    ///
    /// `backing` must be the buffer this reader was created over.
    pub fn rest_bytes(&mut self, backing: &Bytes) -> Bytes {
        let start = self.pos;
        self.pos = self.buf.len();
        backing.slice(start..)
    }

    /// Reject trailing garbage
    pub fn finish(&self) -> ShareResult<()> {
        if self.remaining() != 0 {
            return Err(ShareError::InvalidWireFormat(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Write a u8 length-prefixed string
pub fn put_short_str<B: BufMut>(out: &mut B, s: &str) -> ShareResult<()> {
    let len = u8::try_from(s.len()).map_err(|_| {
        ShareError::InvalidWireFormat(format!("String of {} bytes too long", s.len()))
    })?;
    out.put_u8(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_sequence() {
        let mut buf = Vec::new();
        buf.put_u8(7);
        buf.put_u16_le(0x1234);
        buf.put_u64_le(42);
        put_short_str(&mut buf, "hello").unwrap();
        buf.put_slice(&[1, 2, 3]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u64().unwrap(), 42);
        assert_eq!(r.short_str().unwrap(), "hello");
        assert_eq!(r.rest(), &[1, 2, 3]);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_reader_short_buffer() {
        let mut r = Reader::new(&[1, 2]);
        assert!(matches!(
            r.u64(),
            Err(ShareError::BufferTooShort { expected: 8, actual: 2 })
        ));
    }

    #[test]
    fn test_string_too_long() {
        let long = "x".repeat(300);
        let mut buf = Vec::new();
        assert!(put_short_str(&mut buf, &long).is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut r = Reader::new(&[2, 0xC3, 0x28]);
        assert!(matches!(r.short_str(), Err(ShareError::InvalidWireFormat(_))));
    }
}
