use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

/// An immutable window into a page-aligned buffer.
///
/// `Block` owns the backing bytes (via `Arc` so it can be cheaply shared with
/// an in-flight async write) and a `(offset, size)` window describing the
/// logical content within that buffer - the buffer itself is usually larger,
/// rounded up to a page multiple.
#[derive(Clone)]
pub struct Block {
    data: Arc<[u8]>,
    offset: usize,
    size: usize,
}

impl Block {
    /// Wrap an owned buffer as a block covering its full length.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            data: data.into(),
            offset: 0,
            size,
        }
    }

    /// Wrap a shared buffer, restricting the block to `[offset, offset+size)`.
    pub fn new(data: Arc<[u8]>, offset: usize, size: usize) -> Self {
        Self { data, offset, size }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The full backing buffer, including any page-rounding padding.
    pub fn backing(&self) -> &[u8] {
        &self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }

    pub fn reader(&self) -> BlockReader<'_> {
        BlockReader::new(self.as_slice())
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Sequential little-endian decoder over a byte slice.
///
/// Once a read runs past the end of the slice, `ok` latches `false` and every
/// subsequent read becomes a no-op returning a default value; callers check
/// `ok()` once at the end of a decode sequence rather than after every field.
pub struct BlockReader<'a> {
    buf: &'a [u8],
    pos: usize,
    ok: bool,
}

impl<'a> BlockReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, ok: true }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if !self.ok || self.remaining() < n {
            self.ok = false;
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    pub fn read_bool(&mut self) -> bool {
        match self.take(1) {
            Some(b) => b[0] != 0,
            None => false,
        }
    }

    pub fn read_u8(&mut self) -> u8 {
        self.take(1).map(|b| b[0]).unwrap_or(0)
    }

    pub fn read_u16(&mut self) -> u16 {
        self.take(2).map(LittleEndian::read_u16).unwrap_or(0)
    }

    pub fn read_u32(&mut self) -> u32 {
        self.take(4).map(LittleEndian::read_u32).unwrap_or(0)
    }

    pub fn read_u64(&mut self) -> u64 {
        self.take(8).map(LittleEndian::read_u64).unwrap_or(0)
    }

    /// Read a length-prefixed byte slice, cloning it into freshly owned
    /// memory so the result outlives the block this reader was built over.
    pub fn read_bytes(&mut self) -> Vec<u8> {
        let len = self.read_u32() as usize;
        match self.take(len) {
            Some(s) => s.to_vec(),
            None => Vec::new(),
        }
    }
}

/// Sequential little-endian encoder into a fixed-capacity buffer.
///
/// Writes past the end of the buffer latch `ok` to `false`, mirroring
/// `BlockReader`. The buffer is never grown: callers size it up front (the
/// page-rounded allocation handed out by the storage backend).
pub struct BlockWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    ok: bool,
}

impl<'a> BlockWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0, ok: true }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Number of bytes written so far - the logical content size, excluding
    /// any unused tail of the buffer.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    fn reserve(&mut self, n: usize) -> Option<&mut [u8]> {
        if !self.ok || self.buf.len() - self.pos < n {
            self.ok = false;
            return None;
        }
        let s = &mut self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    pub fn write_bool(&mut self, v: bool) {
        if let Some(s) = self.reserve(1) {
            s[0] = v as u8;
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        if let Some(s) = self.reserve(1) {
            s[0] = v;
        }
    }

    pub fn write_u16(&mut self, v: u16) {
        if let Some(s) = self.reserve(2) {
            LittleEndian::write_u16(s, v);
        }
    }

    pub fn write_u32(&mut self, v: u32) {
        if let Some(s) = self.reserve(4) {
            LittleEndian::write_u32(s, v);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        if let Some(s) = self.reserve(8) {
            LittleEndian::write_u64(s, v);
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        let Ok(len) = u32::try_from(data.len()) else {
            self.ok = false;
            return;
        };
        self.write_u32(len);
        if let Some(s) = self.reserve(data.len()) {
            s.copy_from_slice(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars() {
        let mut buf = [0u8; 64];
        {
            let mut w = BlockWriter::new(&mut buf);
            w.write_bool(true);
            w.write_u8(7);
            w.write_u16(1000);
            w.write_u32(1 << 20);
            w.write_u64(1 << 40);
            w.write_bytes(b"hello");
            assert!(w.ok());
        }
        let mut r = BlockReader::new(&buf);
        assert!(r.read_bool());
        assert_eq!(r.read_u8(), 7);
        assert_eq!(r.read_u16(), 1000);
        assert_eq!(r.read_u32(), 1 << 20);
        assert_eq!(r.read_u64(), 1 << 40);
        assert_eq!(r.read_bytes(), b"hello");
        assert!(r.ok());
    }

    #[test]
    fn write_past_end_latches_not_ok() {
        let mut buf = [0u8; 4];
        let mut w = BlockWriter::new(&mut buf);
        w.write_u64(1);
        assert!(!w.ok());
    }

    #[test]
    fn read_past_end_latches_not_ok() {
        let buf = [1u8, 2];
        let mut r = BlockReader::new(&buf);
        let _ = r.read_u64();
        assert!(!r.ok());
    }
}
