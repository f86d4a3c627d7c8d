//! Read context for deserializing data

use crate::error::CablegramError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Context for reading data during deserialization.
///
/// Wraps a chunked async byte source and adds single-byte lookahead, which
/// the schema reflector needs for the naked-nullable case. Exactly one owner
/// reads from the context at any moment; during streaming decode that owner
/// is the frame dispatcher.
pub struct ReadContext<R: AsyncRead + Unpin> {
    reader: R,
    peeked: Option<u8>,
}

impl<R: AsyncRead + Unpin> ReadContext<R> {
    /// Create a new read context from an async reader
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            peeked: None,
        }
    }

    /// Read a single byte
    pub async fn read_byte(&mut self) -> Result<u8, CablegramError> {
        if let Some(byte) = self.peeked.take() {
            return Ok(byte);
        }
        self.reader.read_u8().await.map_err(map_io_error)
    }

    /// Look at the next byte without consuming it
    pub async fn peek_byte(&mut self) -> Result<u8, CablegramError> {
        if let Some(byte) = self.peeked {
            return Ok(byte);
        }
        let byte = self.reader.read_u8().await.map_err(map_io_error)?;
        self.peeked = Some(byte);
        Ok(byte)
    }

    /// Read a specific number of bytes
    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, CablegramError> {
        let mut buf = vec![0u8; len];
        let mut start = 0;
        if len > 0 {
            if let Some(byte) = self.peeked.take() {
                buf[0] = byte;
                start = 1;
            }
        }
        self.reader
            .read_exact(&mut buf[start..])
            .await
            .map_err(map_io_error)?;
        Ok(buf)
    }
}

fn map_io_error(err: std::io::Error) -> CablegramError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CablegramError::OutOfData
    } else {
        CablegramError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peek_then_read() {
        let data = vec![1u8, 2, 3];
        let mut ctx = ReadContext::new(&data[..]);
        assert_eq!(ctx.peek_byte().await.unwrap(), 1);
        assert_eq!(ctx.peek_byte().await.unwrap(), 1);
        assert_eq!(ctx.read_byte().await.unwrap(), 1);
        assert_eq!(ctx.read_byte().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_bytes_consumes_peeked() {
        let data = vec![1u8, 2, 3, 4];
        let mut ctx = ReadContext::new(&data[..]);
        assert_eq!(ctx.peek_byte().await.unwrap(), 1);
        assert_eq!(ctx.read_bytes(3).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(ctx.read_byte().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_out_of_data() {
        let data = vec![1u8];
        let mut ctx = ReadContext::new(&data[..]);
        ctx.read_byte().await.unwrap();
        assert!(matches!(
            ctx.read_byte().await,
            Err(CablegramError::OutOfData)
        ));
    }
}
