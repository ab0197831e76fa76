//! Binary Writer and Reader
//!
//! Every on-disk structure is composed from a sequence of typed field
//! writes. The reader is the mirror image and is used by the image view
//! and the round-trip tests.
//!
//! All multi-byte values are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{PeError, Result};

/// Growable output buffer with typed little-endian writes
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current write offset
    #[inline]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    #[inline]
    pub fn u16(&mut self, value: u16) {
        let mut field = [0u8; 2];
        LittleEndian::write_u16(&mut field, value);
        self.buf.extend_from_slice(&field);
    }

    #[inline]
    pub fn u32(&mut self, value: u32) {
        let mut field = [0u8; 4];
        LittleEndian::write_u32(&mut field, value);
        self.buf.extend_from_slice(&field);
    }

    #[inline]
    pub fn u64(&mut self, value: u64) {
        let mut field = [0u8; 8];
        LittleEndian::write_u64(&mut field, value);
        self.buf.extend_from_slice(&field);
    }

    /// Emit raw bytes
    #[inline]
    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Emit `bytes` followed by a NUL terminator
    pub fn cstr(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.buf.push(0);
    }

    /// Emit a fixed-width field, NUL-padding or truncating `bytes` to `N`
    pub fn fixed<const N: usize>(&mut self, bytes: &[u8]) {
        let mut field = [0u8; N];
        let len = bytes.len().min(N);
        field[..len].copy_from_slice(&bytes[..len]);
        self.buf.extend_from_slice(&field);
    }

    /// Emit `count` zero bytes
    pub fn zeros(&mut self, count: usize) {
        self.buf.resize(self.buf.len() + count, 0);
    }

    /// Zero-pad up to absolute offset `len`. Does nothing if already past it.
    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    /// Zero-pad to the next multiple of `alignment` (a power of two)
    pub fn align(&mut self, alignment: usize) {
        let len = self.buf.len();
        let aligned = (len + alignment - 1) & !(alignment - 1);
        self.pad_to(aligned);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked cursor over a byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reader positioned at `offset`
    pub fn at(data: &'a [u8], offset: usize) -> Self {
        Self { data, pos: offset }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, offset: usize) {
        self.pos = offset;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Take the next `len` bytes
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(PeError::Truncated {
                offset: self.pos,
                needed: len,
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.bytes(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }

    /// Read a fixed-width field
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Read a NUL-terminated string, consuming the terminator.
    /// The returned slice excludes the NUL.
    pub fn cstr(&mut self) -> Result<&'a [u8]> {
        let rest = self.data.get(self.pos..).unwrap_or(&[]);
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(PeError::Truncated {
                offset: self.pos,
                needed: rest.len() + 1,
            })?;
        let s = self.bytes(len)?;
        self.pos += 1;
        Ok(s)
    }
}
