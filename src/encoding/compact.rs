//! # Compact Little-Endian Integers
//!
//! Minimal-width integer encoding for the persisted page-manager state chain.
//! Unlike [`super::varint`], the byte count is not self-describing: the state
//! chain stores it in the low nibble of each entry's header byte, so the
//! encoding here is just the value's significant bytes, low byte first. A
//! value of zero occupies zero bytes.

use eyre::{ensure, Result};

/// Encodes `value` into `buf` low-byte-first, returning the number of bytes
/// written (0 for a zero value, at most 8).
pub fn encode_compact_u64(mut value: u64, buf: &mut [u8]) -> usize {
    let mut n = 0;
    while value > 0 {
        buf[n] = (value & 0xFF) as u8;
        value >>= 8;
        n += 1;
    }
    n
}

/// Decodes `n` little-endian bytes from the front of `buf`.
pub fn decode_compact_u64(n: usize, buf: &[u8]) -> Result<u64> {
    ensure!(n <= 8, "compact u64 width {} exceeds 8 bytes", n);
    ensure!(
        buf.len() >= n,
        "buffer too small for {}-byte compact u64: {}",
        n,
        buf.len()
    );

    let mut value = 0u64;
    for i in (0..n).rev() {
        value = (value << 8) | buf[i] as u64;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_occupies_no_bytes() {
        let mut buf = [0xFFu8; 8];
        assert_eq!(encode_compact_u64(0, &mut buf), 0);
        assert_eq!(decode_compact_u64(0, &buf).unwrap(), 0);
    }

    #[test]
    fn round_trip_various_widths() {
        let values = [
            1u64,
            0xFF,
            0x100,
            0xFFFF,
            0x10000,
            0xDEAD_BEEF,
            0x0102_0304_0506_0708,
            u64::MAX,
        ];

        for &value in &values {
            let mut buf = [0u8; 8];
            let n = encode_compact_u64(value, &mut buf);
            assert_eq!(n, (8 - value.leading_zeros() as usize / 8).max(1));
            assert_eq!(decode_compact_u64(n, &buf).unwrap(), value);
        }
    }

    #[test]
    fn low_byte_first_layout() {
        let mut buf = [0u8; 8];
        let n = encode_compact_u64(0x0102, &mut buf);

        assert_eq!(n, 2);
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1], 0x01);
    }

    #[test]
    fn decode_rejects_oversized_width() {
        let buf = [0u8; 16];
        assert!(decode_compact_u64(9, &buf).is_err());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = [0u8; 2];
        assert!(decode_compact_u64(4, &buf).is_err());
    }
}
