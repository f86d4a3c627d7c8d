//! Error types for Cablegram

use crate::schema::Schema;
use crate::value::Value;
use thiserror::Error;

/// Main error type for Cablegram operations
#[derive(Debug, Error)]
pub enum CablegramError {
    /// Validation error during serialization
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    /// I/O error on the transport
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Unexpected end of the transport while data was expected
    #[error("attempt to read past end of stream")]
    OutOfData,
    /// Decode-side violation of the wire format
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Invariant violation inside the codec
    #[error("internal error: {0}")]
    Internal(String),
}

impl CablegramError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        CablegramError::Protocol(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        CablegramError::Internal(message.into())
    }
}

/// Error raised when a value does not satisfy its schema
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A user-defined error payload carried through a promise or iterator
/// sub-stream. The schema travels inline with the error value, so receivers
/// can decode it without prior knowledge of the error shape.
///
/// These are delivered to the one consumer whose sub-stream failed; the
/// session keeps running for every other sub-stream.
#[derive(Debug, Clone, Error)]
#[error("serializable error: {data:?}")]
pub struct SerializableError {
    pub schema: Schema,
    pub data: Value,
}

impl SerializableError {
    pub fn new(schema: Schema, data: Value) -> Self {
        Self { schema, data }
    }

    /// Shorthand for the common case of a string error payload.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            schema: Schema::string(),
            data: Value::String(text.into()),
        }
    }
}

/// Failure delivered through a streaming consumer handle.
#[derive(Debug, Clone, Error)]
pub enum StreamFault {
    /// The remote producer emitted a typed error frame.
    #[error("remote producer failed: {0}")]
    Remote(#[from] SerializableError),
    /// The transport ended before this sub-stream terminated.
    #[error("transport ended before the sub-stream terminated")]
    Disconnected,
}
