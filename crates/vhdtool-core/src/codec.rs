//! Big-endian field encoding and the VHD checksum.
//!
//! Every multi-byte integer in a VHD structure is stored big-endian, and
//! every tag is fixed-width ASCII padded with blanks. The footer and the
//! dynamic header carry a ones'-complement checksum over all their bytes,
//! computed with the checksum field itself read as zero.

use std::ops::Range;

/// Encodes a `u16` as big-endian bytes.
#[inline]
pub fn encode_u16_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Encodes a `u32` as big-endian bytes.
#[inline]
pub fn encode_u32_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Encodes a `u64` as big-endian bytes.
#[inline]
pub fn encode_u64_be(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decodes a big-endian `u16` from the first two bytes.
///
/// # Panics
///
/// Panics if `bytes` is shorter than two bytes.
#[inline]
pub fn decode_u16_be(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Decodes a big-endian `u32` from the first four bytes.
///
/// # Panics
///
/// Panics if `bytes` is shorter than four bytes.
#[inline]
pub fn decode_u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Decodes a big-endian `u64` from the first eight bytes.
///
/// # Panics
///
/// Panics if `bytes` is shorter than eight bytes.
#[inline]
pub fn decode_u64_be(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}

/// Computes the VHD checksum of a buffer.
///
/// The checksum is the bitwise complement of the sum of all bytes,
/// accumulated in a wrapping 32-bit counter.
pub fn checksum(buffer: &[u8]) -> u32 {
    !buffer
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}

/// Computes the VHD checksum with the bytes in `field` treated as zero.
///
/// This is how a stored checksum is validated: the checksum field holds
/// the value being checked, so it must not contribute to the sum.
pub fn checksum_excluding(buffer: &[u8], field: Range<usize>) -> u32 {
    !buffer
        .iter()
        .enumerate()
        .filter(|(i, _)| !field.contains(i))
        .fold(0u32, |sum, (_, &b)| sum.wrapping_add(b as u32))
}

/// Encodes an ASCII tag into a fixed-width field, padding with blanks.
///
/// Tags longer than `N` are truncated. Tags are not null-terminated.
pub fn encode_ascii_tag<const N: usize>(tag: &str) -> [u8; N] {
    let mut field = [b' '; N];
    for (dst, src) in field.iter_mut().zip(tag.bytes()) {
        *dst = src;
    }
    field
}

/// Decodes a fixed-width ASCII tag, dropping trailing blanks and NULs.
///
/// Non-ASCII bytes are replaced so that a damaged tag can still be shown.
pub fn decode_ascii_tag(field: &[u8]) -> String {
    let text: String = field
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect();
    text.trim_end_matches([' ', '\0']).to_string()
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encoding_is_big_endian() {
        assert_eq!(encode_u16_be(0x1234), [0x12, 0x34]);
        assert_eq!(encode_u32_be(0x0001_0000), [0x00, 0x01, 0x00, 0x00]);
        assert_eq!(
            encode_u64_be(0x0102_0304_0506_0708),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_integer_decoding() {
        assert_eq!(decode_u16_be(&[0xAB, 0xCD, 0xFF]), 0xABCD);
        assert_eq!(decode_u32_be(&[0xFF, 0xFF, 0xFF, 0xFF]), u32::MAX);
        assert_eq!(decode_u64_be(&[0, 0, 0, 0, 0, 0x20, 0, 0]), 0x20_0000);
    }

    #[test]
    fn test_checksum_of_empty_buffer() {
        assert_eq!(checksum(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_checksum_sums_bytes() {
        // 1 + 2 + 3 = 6, complement = 0xFFFFFFF9
        assert_eq!(checksum(&[1, 2, 3]), !6u32);
    }

    #[test]
    fn test_checksum_excluding_ignores_field() {
        let buffer = [1u8, 2, 0xAA, 0xBB, 3];
        assert_eq!(checksum_excluding(&buffer, 2..4), checksum(&[1, 2, 3]));
    }

    #[test]
    fn test_checksum_self_check() {
        // Stored checksum re-validates when the field is excluded.
        let mut buffer = vec![0x5Au8; 64];
        buffer[8..12].fill(0);
        let sum = checksum(&buffer);
        buffer[8..12].copy_from_slice(&encode_u32_be(sum));
        assert_eq!(checksum_excluding(&buffer, 8..12), sum);
    }

    #[test]
    fn test_ascii_tag_padding() {
        let tag: [u8; 4] = encode_ascii_tag("Mac");
        assert_eq!(&tag, b"Mac ");
        assert_eq!(decode_ascii_tag(&tag), "Mac");

        let long: [u8; 4] = encode_ascii_tag("toolong");
        assert_eq!(&long, b"tool");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_up(513, 512), 1024);
    }
}
