//! # Protocol Errors
//!
//! Errors raised while decoding the reply grammar. Every variant is fatal for
//! the parser that produced it: the byte stream can no longer be framed.

use thiserror::Error;

/// Result alias for protocol-level operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Malformed input detected by the incremental parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// First byte of a value was not one of `+ - : $ *`.
    #[error("invalid type byte 0x{0:02x}")]
    InvalidTypeByte(u8),

    /// Integer reply or length field was empty, non-numeric or overflowed.
    #[error("invalid integer field {0:?}")]
    InvalidInteger(String),

    /// Negative length other than the `-1` null marker.
    #[error("invalid length {0}")]
    InvalidLength(i64),

    /// Bulk string exceeded the accepted maximum.
    #[error("bulk string of {0} bytes exceeds limit")]
    BulkTooLarge(i64),

    /// A simple string, error or length line ran past the accepted maximum
    /// without a CR.
    #[error("line of {0} bytes exceeds limit")]
    LineTooLong(usize),

    /// A CR was not followed by LF, or bulk data was not CRLF terminated.
    #[error("expected CRLF terminator")]
    MissingCrlf,
}
