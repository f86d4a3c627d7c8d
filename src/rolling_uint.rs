//! Rolling uint encoding and decoding
//!
//! Variable-length integer encoding used throughout the protocol. A value
//! is written as the shortest of four little-endian forms keyed by the lead
//! byte: below 0xfd inline, 0xfd + u16, 0xfe + u32, 0xff + u64. Encoding is
//! canonical; decoding accepts longer-than-necessary forms for robustness.

use crate::error::CablegramError;
use crate::read_context::ReadContext;
use tokio::io::AsyncRead;

/// Calculate the size needed to encode a rolling uint
pub fn get_rolling_uint_size(data: u64) -> usize {
    if data < 0xfd {
        1
    } else if data <= 0xffff {
        3
    } else if data <= 0xffffffff {
        5
    } else {
        9
    }
}

/// Write a rolling uint to a buffer at the specified position
/// Returns the new position after writing
pub fn write_rolling_uint_no_alloc(data: u64, buf: &mut [u8], pos: usize) -> usize {
    if data < 0xfd {
        buf[pos] = data as u8;
        pos + 1
    } else if data <= 0xffff {
        buf[pos] = 0xfd;
        buf[pos + 1..pos + 3].copy_from_slice(&(data as u16).to_le_bytes());
        pos + 3
    } else if data <= 0xffffffff {
        buf[pos] = 0xfe;
        buf[pos + 1..pos + 5].copy_from_slice(&(data as u32).to_le_bytes());
        pos + 5
    } else {
        buf[pos] = 0xff;
        buf[pos + 1..pos + 9].copy_from_slice(&data.to_le_bytes());
        pos + 9
    }
}

/// Append a rolling uint to a growable buffer
pub fn push_rolling_uint(out: &mut Vec<u8>, data: u64) {
    let start = out.len();
    out.resize(start + get_rolling_uint_size(data), 0);
    write_rolling_uint_no_alloc(data, out, start);
}

/// Read a rolling uint through a read context
pub async fn read_rolling_uint<R: AsyncRead + Unpin>(
    ctx: &mut ReadContext<R>,
) -> Result<u64, CablegramError> {
    let first_byte = ctx.read_byte().await?;

    if first_byte < 0xfd {
        Ok(first_byte as u64)
    } else if first_byte == 0xfd {
        let bytes = ctx.read_bytes(2).await?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
    } else if first_byte == 0xfe {
        let bytes = ctx.read_bytes(4).await?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
    } else {
        let bytes = ctx.read_bytes(8).await?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(arr))
    }
}

/// Zigzag-encode a signed integer for rolling uint transport.
///
/// Arithmetic is 32 bits wide to stay byte-compatible with existing peers;
/// magnitudes of 2^31 and above wrap and do not round-trip.
pub fn zigzag_encode(value: i64) -> u64 {
    let v = value as i32;
    ((v << 1) ^ (v >> 31)) as u32 as u64
}

/// Inverse of [`zigzag_encode`], with the same 32-bit arithmetic width.
pub fn zigzag_decode(raw: u64) -> i64 {
    let z = raw as u32;
    (((z >> 1) as i32) ^ -((z & 1) as i32)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_uint_size() {
        assert_eq!(get_rolling_uint_size(0), 1);
        assert_eq!(get_rolling_uint_size(252), 1);
        assert_eq!(get_rolling_uint_size(253), 3);
        assert_eq!(get_rolling_uint_size(0xffff), 3);
        assert_eq!(get_rolling_uint_size(0x10000), 5);
        assert_eq!(get_rolling_uint_size(0xffffffff), 5);
        assert_eq!(get_rolling_uint_size(0x100000000), 9);
    }

    #[test]
    fn test_write_rolling_uint() {
        let mut buf = vec![0u8; 16];

        let pos = write_rolling_uint_no_alloc(42, &mut buf, 0);
        assert_eq!(pos, 1);
        assert_eq!(buf[0], 42);

        let pos = write_rolling_uint_no_alloc(300, &mut buf, 0);
        assert_eq!(pos, 3);
        assert_eq!(&buf[..3], &[0xfd, 44, 1]);

        let pos = write_rolling_uint_no_alloc(253, &mut buf, 0);
        assert_eq!(pos, 3);
        assert_eq!(&buf[..3], &[0xfd, 0xfd, 0x00]);

        let pos = write_rolling_uint_no_alloc(0x12345678, &mut buf, 0);
        assert_eq!(pos, 5);
        assert_eq!(&buf[..5], &[0xfe, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_push_rolling_uint() {
        let mut out = vec![0xaa];
        push_rolling_uint(&mut out, 5);
        push_rolling_uint(&mut out, 300);
        assert_eq!(out, vec![0xaa, 5, 0xfd, 44, 1]);
    }

    #[tokio::test]
    async fn test_read_rolling_uint() {
        for value in [0u64, 1, 252, 253, 0xffff, 0x10000, 0xffffffff, 0x100000000] {
            let mut buf = vec![0u8; 9];
            let len = write_rolling_uint_no_alloc(value, &mut buf, 0);
            buf.truncate(len);
            let mut ctx = ReadContext::new(&buf[..]);
            assert_eq!(read_rolling_uint(&mut ctx).await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn test_read_non_canonical_encoding() {
        // 5 written in the 0xfd form is never produced but still decodes.
        let data = vec![0xfd, 0x05, 0x00];
        let mut ctx = ReadContext::new(&data[..]);
        assert_eq!(read_rolling_uint(&mut ctx).await.unwrap(), 5);
    }

    #[test]
    fn test_zigzag_small_values() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        for value in [-1000i64, -42, 0, 7, 123456, -123456] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn test_zigzag_32_bit_width() {
        assert_eq!(zigzag_decode(zigzag_encode(i32::MAX as i64)), i32::MAX as i64);
        assert_eq!(zigzag_decode(zigzag_encode(i32::MIN as i64)), i32::MIN as i64);
        // Beyond 32 bits the encoding wraps and does not round-trip.
        assert_ne!(zigzag_decode(zigzag_encode(1i64 << 33)), 1i64 << 33);
    }
}
