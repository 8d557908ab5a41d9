//! Byte-level encoding primitives shared by every wire and storage format.
//!
//! All multi-byte integers are little-endian. Variable-length blobs are
//! prefixed with their length as a 4-byte LE integer. Reads are bounds-checked
//! and fail with a typed error rather than panicking on truncated input.

/// Errors from decoding byte buffers.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CodecError {
    #[error("data truncated: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        need: usize,
        offset: usize,
        have: usize,
    },
    #[error("declared length {0} exceeds limit {1}")]
    LengthOverflow(usize, usize),
    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),
}

/// Append-only byte buffer with little-endian primitives.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16_be(&mut self, v: u16) {
        // network byte order, used only for ports inside NetAddr
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    /// Append raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append a 4-byte LE length followed by the bytes themselves.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte slice with bounds-checked little-endian reads.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                need: n,
                offset: self.pos,
                have: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_be(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.u32()? as i32)
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.u64()? as i64)
    }

    /// Read exactly `n` raw bytes.
    pub fn raw(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Read a fixed 32-byte array.
    pub fn hash(&mut self) -> Result<crate::Hash, CodecError> {
        let b = self.take(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// Read a 4-byte LE length prefix followed by that many bytes.
    ///
    /// The declared length is capped by the remaining input, so a crafted
    /// prefix cannot trigger an oversized allocation.
    pub fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        if len > self.remaining() {
            return Err(CodecError::LengthOverflow(len, self.remaining()));
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Fail unless the entire input has been consumed.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.remaining() > 0 {
            return Err(CodecError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_roundtrip() {
        let mut w = Writer::new();
        w.put_u8(0xAB);
        w.put_u32(0xDEAD_BEEF);
        w.put_u64(u64::MAX - 1);
        w.put_i32(-1);
        w.put_i64(-42);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.u8().unwrap(), 0xAB);
        assert_eq!(r.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.i32().unwrap(), -1);
        assert_eq!(r.i64().unwrap(), -42);
        r.finish().unwrap();
    }

    #[test]
    fn little_endian_layout() {
        let mut w = Writer::new();
        w.put_u32(1);
        assert_eq!(w.into_bytes(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn port_is_big_endian() {
        let mut w = Writer::new();
        w.put_u16_be(9333);
        let bytes = w.into_bytes();
        assert_eq!(bytes, 9333u16.to_be_bytes());
        let mut r = Reader::new(&bytes);
        assert_eq!(r.u16_be().unwrap(), 9333);
    }

    #[test]
    fn length_prefixed_bytes() {
        let mut w = Writer::new();
        w.put_bytes(b"hello");
        w.put_bytes(b"");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.bytes().unwrap(), b"hello");
        assert_eq!(r.bytes().unwrap(), b"");
        r.finish().unwrap();
    }

    #[test]
    fn truncated_read_fails() {
        let mut r = Reader::new(&[1, 2]);
        match r.u32() {
            Err(CodecError::Truncated { need: 4, .. }) => {}
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn crafted_length_prefix_rejected() {
        // length prefix claims 4 GiB but only 2 bytes follow
        let mut w = Writer::new();
        w.put_u32(u32::MAX);
        w.put_raw(&[0, 0]);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert!(matches!(r.bytes(), Err(CodecError::LengthOverflow(_, 2))));
    }

    #[test]
    fn trailing_bytes_detected() {
        let r = Reader::new(&[0]);
        assert!(matches!(r.finish(), Err(CodecError::TrailingBytes(1))));
    }
}
