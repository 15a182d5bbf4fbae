//! Utility functions for binary data processing.
//!
//! This module provides primitives shared across the Mach-O layer:
//! - Unaligned little-endian reads (using byteorder for optimal codegen)
//! - SIMD-accelerated null scans (via memchr) for embedded C strings
//! - LEB128 decoding and length-preserving encoding for bind streams
//! - Alignment helpers for load-command and fat-slice layout

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Fast Unaligned Reads
// =============================================================================

/// Reads a little-endian u32 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 4`.
#[inline(always)]
pub fn read_u32_le(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

// =============================================================================
// SIMD-Accelerated Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Uses the `memchr` crate (AVX2/NEON vectorization where available), which
/// is typically 4-8x faster than a naive byte-by-byte loop. Returns the slice
/// length when no null byte is present.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

// =============================================================================
// LEB128
// =============================================================================

/// Reads an unsigned LEB128 value with fast paths for common cases.
///
/// 1-byte values (0-127) and 2-byte values (128-16383) bypass the loop; they
/// cover nearly every ordinal and offset that appears in bind streams.
///
/// # Returns
///
/// `(value, bytes_consumed)` or `None` if invalid.
#[inline(always)]
pub fn read_uleb128(data: &[u8]) -> Option<(u64, usize)> {
    if data.is_empty() {
        return None;
    }

    let b0 = data[0];

    // Fast path: single byte (0-127) - most common case
    if b0 < 0x80 {
        return Some((b0 as u64, 1));
    }

    if data.len() < 2 {
        return None;
    }

    let b1 = data[1];

    // Fast path: two bytes (128-16383)
    if b1 < 0x80 {
        let value = ((b0 & 0x7F) as u64) | ((b1 as u64) << 7);
        return Some((value, 2));
    }

    // Fall back to general loop for larger values
    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None; // Overflow
        }

        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;

        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }

    None
}

/// Reads a signed LEB128 value.
///
/// # Returns
///
/// `(value, bytes_consumed)` or `None` if invalid.
#[inline(always)]
pub fn read_sleb128(data: &[u8]) -> Option<(i64, usize)> {
    if data.is_empty() {
        return None;
    }

    let b0 = data[0];

    // Fast path: single byte
    if b0 < 0x80 {
        let value = if (b0 & 0x40) != 0 {
            (b0 as i64) | !0x7F_i64
        } else {
            b0 as i64
        };
        return Some((value, 1));
    }

    // Fall back to general loop
    let mut result: i64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;

        if byte < 0x80 {
            // Sign extend
            if shift < 64 && (byte & 0x40) != 0 {
                result |= !0_i64 << shift;
            }
            return Some((result, i + 1));
        }
    }

    None
}

/// Returns the minimal encoded length of a ULEB128 value.
#[inline(always)]
pub const fn uleb128_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Encodes a ULEB128 value into exactly `buf.len()` bytes.
///
/// LEB128 permits redundant continuation bytes (`0x80 .. 0x00`), so any value
/// whose minimal encoding fits can be padded out to the full slot length.
/// Rewriting a bind-stream slot in place depends on this: the slot keeps its
/// byte length, so no surrounding offsets move.
///
/// Returns `false` when the minimal encoding is longer than the slot.
#[inline]
pub fn write_uleb128_padded(buf: &mut [u8], value: u64) -> bool {
    if uleb128_len(value) > buf.len() {
        return false;
    }
    let mut v = value;
    let last = buf.len() - 1;
    for (i, slot) in buf.iter_mut().enumerate() {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        *slot = if i == last { byte } else { byte | 0x80 };
    }
    true
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
///
/// # Panics
///
/// Debug assertion fails if `alignment` is not a power of 2.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_le() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(read_u32_le(&data), 0x04030201);
    }

    #[test]
    fn test_memchr_null() {
        assert_eq!(memchr_null(b"hello\0world"), 5);
        assert_eq!(memchr_null(b"\0"), 0);
        assert_eq!(memchr_null(b"hello"), 5);
    }

    #[test]
    fn test_uleb128() {
        // Single byte
        assert_eq!(read_uleb128(&[0x00]), Some((0, 1)));
        assert_eq!(read_uleb128(&[0x01]), Some((1, 1)));
        assert_eq!(read_uleb128(&[0x7F]), Some((127, 1)));

        // Two bytes
        assert_eq!(read_uleb128(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_uleb128(&[0xFF, 0x01]), Some((255, 2)));

        // Multi-byte
        assert_eq!(read_uleb128(&[0xE5, 0x8E, 0x26]), Some((624485, 3)));

        // Redundant padding still decodes
        assert_eq!(read_uleb128(&[0x83, 0x00]), Some((3, 2)));
    }

    #[test]
    fn test_sleb128() {
        assert_eq!(read_sleb128(&[0x00]), Some((0, 1)));
        assert_eq!(read_sleb128(&[0x01]), Some((1, 1)));
        assert_eq!(read_sleb128(&[0x7F]), Some((-1, 1)));
        assert_eq!(read_sleb128(&[0x40]), Some((-64, 1)));
    }

    #[test]
    fn test_uleb128_len() {
        assert_eq!(uleb128_len(0), 1);
        assert_eq!(uleb128_len(127), 1);
        assert_eq!(uleb128_len(128), 2);
        assert_eq!(uleb128_len(16383), 2);
        assert_eq!(uleb128_len(16384), 3);
    }

    #[test]
    fn test_write_uleb128_padded() {
        let mut buf = [0u8; 1];
        assert!(write_uleb128_padded(&mut buf, 5));
        assert_eq!(buf, [0x05]);

        // Padding a small value into a wider slot
        let mut buf = [0u8; 2];
        assert!(write_uleb128_padded(&mut buf, 3));
        assert_eq!(buf, [0x83, 0x00]);
        assert_eq!(read_uleb128(&buf), Some((3, 2)));

        let mut buf = [0u8; 2];
        assert!(write_uleb128_padded(&mut buf, 300));
        assert_eq!(read_uleb128(&buf), Some((300, 2)));

        // Value too large for the slot
        let mut buf = [0u8; 1];
        assert!(!write_uleb128_padded(&mut buf, 128));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(7, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(0x1000, 0x4000), 0x4000);
    }
}
