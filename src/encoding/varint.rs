//! # Variable-Length Integer Encoding
//!
//! Self-describing varint used for length fields in leaf cells and blob
//! headers. The leading byte selects the width:
//!
//! ```text
//! Marker 0-240:   value is the marker itself
//! Marker 241-248: 2 bytes, value = 240 + ((marker - 241) << 8) + next
//! Marker 249:     3 bytes, value = 2288 + big-endian u16
//! Marker 250:     4 bytes, value in next 3 bytes (big-endian)
//! Marker 251:     5 bytes, value in next 4 bytes (big-endian)
//! Marker 255:     9 bytes, value in next 8 bytes (big-endian)
//! ```
//!
//! Optimized for the common case: lengths up to 240 cost a single byte,
//! typical record sizes cost two. All functions are allocation-free and
//! operate on plain byte slices.

use eyre::{bail, ensure, Result};

/// Number of bytes `encode_varint` will write for `value`.
pub fn varint_len(value: u64) -> usize {
    if value <= 240 {
        1
    } else if value <= 2287 {
        2
    } else if value <= 67823 {
        3
    } else if value <= 0xFF_FFFF {
        4
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// Encodes `value` into `buf`, returning the number of bytes written.
pub fn encode_varint(value: u64, buf: &mut [u8]) -> usize {
    if value <= 240 {
        buf[0] = value as u8;
        1
    } else if value <= 2287 {
        let v = value - 240;
        buf[0] = ((v >> 8) + 241) as u8;
        buf[1] = (v & 0xFF) as u8;
        2
    } else if value <= 67823 {
        let v = value - 2288;
        buf[0] = 249;
        buf[1] = (v >> 8) as u8;
        buf[2] = (v & 0xFF) as u8;
        3
    } else if value <= 0xFF_FFFF {
        buf[0] = 250;
        buf[1] = (value >> 16) as u8;
        buf[2] = (value >> 8) as u8;
        buf[3] = value as u8;
        4
    } else if value <= 0xFFFF_FFFF {
        buf[0] = 251;
        buf[1] = (value >> 24) as u8;
        buf[2] = (value >> 16) as u8;
        buf[3] = (value >> 8) as u8;
        buf[4] = value as u8;
        5
    } else {
        buf[0] = 255;
        buf[1..9].copy_from_slice(&value.to_be_bytes());
        9
    }
}

/// Decodes a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    ensure!(!buf.is_empty(), "empty buffer for varint decode");

    let first = buf[0];

    if first <= 240 {
        Ok((first as u64, 1))
    } else if first <= 248 {
        ensure!(buf.len() >= 2, "truncated 2-byte varint");
        let value = 240 + ((first as u64 - 241) << 8) + buf[1] as u64;
        Ok((value, 2))
    } else if first == 249 {
        ensure!(buf.len() >= 3, "truncated 3-byte varint");
        let value = 2288 + ((buf[1] as u64) << 8) + buf[2] as u64;
        Ok((value, 3))
    } else if first == 250 {
        ensure!(buf.len() >= 4, "truncated 4-byte varint");
        let value = ((buf[1] as u64) << 16) + ((buf[2] as u64) << 8) + buf[3] as u64;
        Ok((value, 4))
    } else if first == 251 {
        ensure!(buf.len() >= 5, "truncated 5-byte varint");
        let value = ((buf[1] as u64) << 24)
            + ((buf[2] as u64) << 16)
            + ((buf[3] as u64) << 8)
            + buf[4] as u64;
        Ok((value, 5))
    } else if first == 255 {
        ensure!(buf.len() >= 9, "truncated 9-byte varint");
        let value = u64::from_be_bytes(buf[1..9].try_into().unwrap()); // INVARIANT: length validated above
        Ok((value, 9))
    } else {
        bail!("invalid varint marker: {}", first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_len_boundaries() {
        assert_eq!(varint_len(240), 1);
        assert_eq!(varint_len(241), 2);
        assert_eq!(varint_len(2287), 2);
        assert_eq!(varint_len(2288), 3);
        assert_eq!(varint_len(67823), 3);
        assert_eq!(varint_len(67824), 4);
        assert_eq!(varint_len(0xFF_FFFF), 4);
        assert_eq!(varint_len(0x100_0000), 5);
        assert_eq!(varint_len(0xFFFF_FFFF), 5);
        assert_eq!(varint_len(0x1_0000_0000), 9);
        assert_eq!(varint_len(u64::MAX), 9);
    }

    #[test]
    fn round_trip_at_boundaries() {
        let values = [
            0u64,
            1,
            240,
            241,
            2287,
            2288,
            67823,
            67824,
            0xFF_FFFF,
            0x100_0000,
            0xFFFF_FFFF,
            0x1_0000_0000,
            u64::MAX,
        ];

        for &value in &values {
            let mut buf = [0u8; 9];
            let written = encode_varint(value, &mut buf);
            assert_eq!(written, varint_len(value));

            let (decoded, read) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value, "value {} did not round-trip", value);
            assert_eq!(read, written);
        }
    }

    #[test]
    fn decode_empty_buffer_fails() {
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn decode_truncated_fails() {
        let mut buf = [0u8; 9];
        encode_varint(1000, &mut buf);
        assert!(decode_varint(&buf[..1]).is_err());
    }

    #[test]
    fn decode_reserved_marker_fails() {
        assert!(decode_varint(&[252, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(decode_varint(&[254, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
