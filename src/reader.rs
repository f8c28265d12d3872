//! Positioned reader over an immutable byte region.
//!
//! This is the cursor the opcode and trie decoders run on: sequential reads,
//! seeks, peeks and LEB128 decoding, all bounds checked against the region.

use crate::error::{Error, Result};
use crate::util::{memchr_null, read_ptr_le_at, read_sleb128_fast, read_u32_le_at, read_uleb128_fast};

/// A bounds-checked cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current position relative to the start of the region.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Length of the underlying region.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of bytes left after the current position.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Returns true once the cursor has reached the end of the region.
    #[inline]
    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Moves to an absolute position. Seeking to the end is allowed.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(Error::UnexpectedEof { offset: pos });
        }
        self.pos = pos;
        Ok(())
    }

    /// Skips `count` bytes forward.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        let target = self
            .pos
            .checked_add(count)
            .ok_or(Error::UnexpectedEof { offset: self.pos })?;
        self.seek(target)
    }

    /// Steps `count` bytes backward.
    pub fn retreat(&mut self, count: usize) -> Result<()> {
        let target = self
            .pos
            .checked_sub(count)
            .ok_or(Error::UnexpectedEof { offset: self.pos })?;
        self.seek(target)
    }

    /// Returns the next byte without consuming it.
    #[inline]
    pub fn peek_u8(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(Error::UnexpectedEof { offset: self.pos })
    }

    /// Reads one byte.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = self.peek_u8()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let value =
            read_u32_le_at(self.data, self.pos).ok_or(Error::UnexpectedEof { offset: self.pos })?;
        self.pos += 4;
        Ok(value)
    }

    /// Reads a pointer of `width` bytes (4 or 8).
    pub fn read_ptr(&mut self, width: usize) -> Result<u64> {
        let value = read_ptr_le_at(self.data, self.pos, width)
            .ok_or(Error::UnexpectedEof { offset: self.pos })?;
        self.pos += width;
        Ok(value)
    }

    /// Reads an unsigned LEB128 value.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let tail = self.data.get(self.pos..).unwrap_or_default();
        let (value, len) =
            read_uleb128_fast(tail).ok_or(Error::InvalidUleb128 { offset: self.pos })?;
        self.pos += len;
        Ok(value)
    }

    /// Reads a signed LEB128 value.
    pub fn read_sleb128(&mut self) -> Result<i64> {
        let tail = self.data.get(self.pos..).unwrap_or_default();
        let (value, len) =
            read_sleb128_fast(tail).ok_or(Error::InvalidUleb128 { offset: self.pos })?;
        self.pos += len;
        Ok(value)
    }

    /// Reads a NUL-terminated string and consumes its terminator.
    ///
    /// A string running into the end of the region is an error; the decoders
    /// must not guess where an unterminated operand ends.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let tail = self
            .data
            .get(self.pos..)
            .ok_or(Error::UnexpectedEof { offset: self.pos })?;
        let len = memchr_null(tail);
        if len == tail.len() {
            return Err(Error::UnexpectedEof {
                offset: self.data.len(),
            });
        }
        self.pos += len + 1;
        Ok(&tail[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_reads() {
        let data = [0x2A, 0x78, 0x56, 0x34, 0x12, 0xE5, 0x8E, 0x26, 0x7F];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x2A);
        assert_eq!(reader.read_u32().unwrap(), 0x12345678);
        assert_eq!(reader.read_uleb128().unwrap(), 624485);
        assert_eq!(reader.read_sleb128().unwrap(), -1);
        assert!(reader.at_end());
        assert!(matches!(
            reader.read_u8(),
            Err(Error::UnexpectedEof { offset: 9 })
        ));
    }

    #[test]
    fn test_cstr_and_seek() {
        let data = b"_foo\0_bar\0";
        let mut reader = ByteReader::new(data);
        assert_eq!(reader.read_cstr().unwrap(), b"_foo");
        assert_eq!(reader.position(), 5);
        assert_eq!(reader.peek_u8().unwrap(), b'_');
        reader.retreat(5).unwrap();
        reader.advance(5).unwrap();
        assert_eq!(reader.read_cstr().unwrap(), b"_bar");
        assert!(reader.seek(11).is_err());
    }

    #[test]
    fn test_unterminated_cstr_is_error() {
        let mut reader = ByteReader::new(b"abc");
        assert!(reader.read_cstr().is_err());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_truncated_uleb() {
        let mut reader = ByteReader::new(&[0x80, 0x80]);
        assert!(matches!(
            reader.read_uleb128(),
            Err(Error::InvalidUleb128 { offset: 0 })
        ));
    }

    #[test]
    fn test_read_ptr() {
        let data = [1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_ptr(4).unwrap(), 1);
        assert_eq!(reader.read_ptr(8).unwrap(), 2);
        assert_eq!(reader.remaining(), 0);
    }
}
