//! Write context for serializing into a preallocated buffer

use crate::error::CablegramError;
use crate::rolling_uint::{get_rolling_uint_size, write_rolling_uint_no_alloc};

/// Cursor over a byte region whose exact size was computed by the plan pass.
///
/// Running past the end of the region means the plan and emit passes
/// disagreed about a size, which is a codec bug, so overflow surfaces as an
/// internal error rather than a panic.
pub struct WriteCursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> WriteCursor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), CablegramError> {
        self.ensure(1)?;
        self.buf[self.pos] = byte;
        self.pos += 1;
        Ok(())
    }

    pub fn write_bytes(&mut self, src: &[u8]) -> Result<(), CablegramError> {
        self.ensure(src.len())?;
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
        Ok(())
    }

    pub fn write_rolling_uint(&mut self, data: u64) -> Result<(), CablegramError> {
        self.ensure(get_rolling_uint_size(data))?;
        self.pos = write_rolling_uint_no_alloc(data, self.buf, self.pos);
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure(&self, len: usize) -> Result<(), CablegramError> {
        if self.pos + len > self.buf.len() {
            return Err(CablegramError::internal(format!(
                "write of {} bytes overflows buffer of {} at position {}",
                len,
                self.buf.len(),
                self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_writes() {
        let mut buf = vec![0u8; 5];
        let mut cur = WriteCursor::new(&mut buf);
        cur.write_byte(1).unwrap();
        cur.write_bytes(&[2, 3]).unwrap();
        cur.write_rolling_uint(4).unwrap();
        assert_eq!(cur.position(), 4);
        assert_eq!(cur.remaining(), 1);
        cur.write_byte(5).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cursor_overflow_is_internal_error() {
        let mut buf = vec![0u8; 1];
        let mut cur = WriteCursor::new(&mut buf);
        cur.write_byte(1).unwrap();
        assert!(matches!(
            cur.write_byte(2),
            Err(CablegramError::Internal(_))
        ));
    }
}
