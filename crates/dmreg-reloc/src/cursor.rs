//! Little-endian byte writer/reader used by every block encoding.
//!
//! Pointers inside a block are absolute addresses in the block's address
//! space: `base + offset`. A zero pointer is null; offset 0 always holds the
//! block's top record, which nothing points back to.

use dmreg_core::error::{Error, ErrorKind, Result};

/// Growable output buffer with patchable slots.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
    base: u64,
}

impl Writer {
    pub fn new(base: u64) -> Self {
        Self {
            buf: Vec::new(),
            base,
        }
    }

    pub fn with_capacity(base: u64, cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            base,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `len` zero bytes and return their offset.
    pub fn reserve(&mut self, len: usize) -> usize {
        let at = self.buf.len();
        self.buf.resize(at + len, 0);
        at
    }

    /// Address of `offset` in this block's address space.
    pub fn ptr(&self, offset: usize) -> u64 {
        self.base + offset as u64
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// `u32` length followed by the bytes.
    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.put_bytes(s.as_bytes());
    }

    pub fn set_u8(&mut self, at: usize, v: u8) {
        self.buf[at] = v;
    }

    pub fn set_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn set_u64(&mut self, at: usize, v: u64) {
        self.buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn set_bytes(&mut self, at: usize, b: &[u8]) {
        self.buf[at..at + b.len()].copy_from_slice(b);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

fn bad(what: &str) -> Error {
    Error::at(ErrorKind::BadBlock, what)
}

/// Bounds-checked view over a block whose pointers live in `base`'s space.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
    base: u64,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], base: u64) -> Self {
        Self { buf, base }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn bytes(&self, at: usize, len: usize) -> Result<&'a [u8]> {
        let end = at.checked_add(len).ok_or_else(|| bad("length overflow"))?;
        self.buf.get(at..end).ok_or_else(|| bad("read past end of block"))
    }

    pub fn u8(&self, at: usize) -> Result<u8> {
        Ok(self.bytes(at, 1)?[0])
    }

    pub fn u32(&self, at: usize) -> Result<u32> {
        let b = self.bytes(at, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&self, at: usize) -> Result<u64> {
        let b = self.bytes(at, 8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    pub fn str(&self, at: usize, len: usize) -> Result<&'a str> {
        std::str::from_utf8(self.bytes(at, len)?).map_err(|_| bad("invalid utf-8"))
    }

    /// Offset a non-null pointer refers to. Null yields `None`.
    pub fn offset_of_ptr(&self, ptr: u64) -> Result<Option<usize>> {
        if ptr == 0 {
            return Ok(None);
        }
        let off = ptr
            .checked_sub(self.base)
            .ok_or_else(|| bad("pointer below block base"))?;
        if off >= self.buf.len() as u64 {
            return Err(bad("pointer past end of block"));
        }
        Ok(Some(off as usize))
    }

    /// Like [`Reader::offset_of_ptr`] but null is an error.
    pub fn deref(&self, ptr: u64) -> Result<usize> {
        self.offset_of_ptr(ptr)?.ok_or_else(|| bad("unexpected null pointer"))
    }
}

/// Sequential reader over a flat (pointer-free) record stream.
#[derive(Debug)]
pub struct Stream<'a> {
    reader: Reader<'a>,
    pos: usize,
}

impl<'a> Stream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            reader: Reader::new(buf, 0),
            pos: 0,
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.reader.len()
    }

    pub fn u8(&mut self) -> Result<u8> {
        let v = self.reader.u8(self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let v = self.reader.u32(self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let v = self.reader.u64(self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let v = self.reader.bytes(self.pos, len)?;
        self.pos += len;
        Ok(v)
    }

    pub fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let v = self.reader.str(self.pos, len)?;
        self.pos += len;
        Ok(v.to_string())
    }
}

/// Rewrite the pointer stored at `at` from `old_base`'s space to `new_base`'s.
/// Null stays null.
pub fn rebase_ptr(buf: &mut [u8], at: usize, old_base: u64, new_base: u64) -> Result<()> {
    let slot = buf
        .get_mut(at..at + 8)
        .ok_or_else(|| bad("pointer slot past end of block"))?;
    let mut a = [0u8; 8];
    a.copy_from_slice(slot);
    let ptr = u64::from_le_bytes(a);
    if ptr == 0 {
        return Ok(());
    }
    let off = ptr
        .checked_sub(old_base)
        .ok_or_else(|| bad("pointer below block base"))?;
    let moved = new_base
        .checked_add(off)
        .ok_or_else(|| bad("pointer overflows the new base"))?;
    slot.copy_from_slice(&moved.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_rejects_out_of_range_pointers() {
        let buf = [0u8; 16];
        let r = Reader::new(&buf, 0x1000);
        assert_eq!(r.offset_of_ptr(0).unwrap(), None);
        assert_eq!(r.offset_of_ptr(0x1008).unwrap(), Some(8));
        assert_eq!(r.offset_of_ptr(0x0800).unwrap_err().kind(), ErrorKind::BadBlock);
        assert_eq!(r.offset_of_ptr(0x1010).unwrap_err().kind(), ErrorKind::BadBlock);
    }

    #[test]
    fn rebase_ptr_keeps_null_and_shifts_the_rest() {
        let mut buf = vec![0u8; 16];
        buf[8..16].copy_from_slice(&0x1004u64.to_le_bytes());
        rebase_ptr(&mut buf, 0, 0x1000, 0x9000).unwrap();
        rebase_ptr(&mut buf, 8, 0x1000, 0x9000).unwrap();
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 0x9004);
    }
}
