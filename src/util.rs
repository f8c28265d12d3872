//! Low-level helpers for reading Mach-O data.
//!
//! Mach-O images are little-endian on every architecture this crate accepts,
//! while fat headers are always big-endian. All readers here are checked: they
//! return `None` instead of panicking when the slice is too short.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

// =============================================================================
// Checked Unaligned Reads
// =============================================================================

/// Reads a little-endian u16 at `offset`, if in bounds.
#[inline(always)]
pub fn read_u16_le_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(LittleEndian::read_u16(bytes))
}

/// Reads a little-endian u32 at `offset`, if in bounds.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(LittleEndian::read_u32(bytes))
}

/// Reads a little-endian u64 at `offset`, if in bounds.
#[inline(always)]
pub fn read_u64_le_at(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    Some(LittleEndian::read_u64(bytes))
}

/// Reads a big-endian u32 at `offset` (fat headers), if in bounds.
#[inline(always)]
pub fn read_u32_be_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(BigEndian::read_u32(bytes))
}

/// Reads a big-endian u64 at `offset` (64-bit fat headers), if in bounds.
#[inline(always)]
pub fn read_u64_be_at(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    Some(BigEndian::read_u64(bytes))
}

/// Reads a pointer of `width` bytes (4 or 8) at `offset`, zero-extended.
#[inline(always)]
pub fn read_ptr_le_at(data: &[u8], offset: usize, width: usize) -> Option<u64> {
    if width == 8 {
        read_u64_le_at(data, offset)
    } else {
        read_u32_le_at(data, offset).map(u64::from)
    }
}

// =============================================================================
// NUL-terminated Strings
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns `data.len()` when no terminator is present.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Returns the C string starting at `offset`, without its terminator.
///
/// An unterminated string at the end of the buffer is returned up to the end.
#[inline]
pub fn cstr_at(data: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = data.get(offset..)?;
    Some(&tail[..memchr_null(tail)])
}

/// Returns a fixed 16-byte Mach-O name field as a string slice.
#[inline]
pub fn fixed_name(raw: &[u8; 16]) -> &str {
    let end = memchr_null(raw);
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

// =============================================================================
// LEB128 Fast Path
// =============================================================================

/// Reads an unsigned LEB128 value with fast paths for common cases.
///
/// Most LEB128 values in Mach-O files are small (ordinals, offsets, skips),
/// so the one- and two-byte forms avoid the loop.
///
/// # Returns
///
/// `(value, bytes_consumed)` or `None` if truncated or wider than 64 bits.
#[inline(always)]
pub fn read_uleb128_fast(data: &[u8]) -> Option<(u64, usize)> {
    let b0 = *data.first()?;
    if b0 < 0x80 {
        return Some((u64::from(b0), 1));
    }

    let b1 = *data.get(1)?;
    if b1 < 0x80 {
        let value = u64::from(b0 & 0x7F) | (u64::from(b1) << 7);
        return Some((value, 2));
    }

    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }

        result |= u64::from(byte & 0x7F) << shift;
        shift += 7;

        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }

    None
}

/// Reads a signed LEB128 value with a fast path for single-byte values.
#[inline(always)]
pub fn read_sleb128_fast(data: &[u8]) -> Option<(i64, usize)> {
    let b0 = *data.first()?;
    if b0 < 0x80 {
        // Sign extend from 7 bits
        let value = if (b0 & 0x40) != 0 {
            i64::from(b0) | !0x7F_i64
        } else {
            i64::from(b0)
        };
        return Some((value, 1));
    }

    let mut result: i64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }

        result |= i64::from(byte & 0x7F) << shift;
        shift += 7;

        if byte < 0x80 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= !0_i64 << shift;
            }
            return Some((result, i + 1));
        }
    }

    None
}
