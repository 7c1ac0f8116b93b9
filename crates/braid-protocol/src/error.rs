//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol frames.
///
/// Every variant except `Io` indicates a framing error, which is fatal to
/// the connection that produced it.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame length field declares zero bytes (a frame needs at least a type byte)
    #[error("Empty frame: length prefix declares zero bytes")]
    EmptyFrame,

    /// Frame exceeds the maximum allowed size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame body ended before a required field
    #[error("Truncated {kind} frame: needed {needed} more bytes")]
    Truncated { kind: &'static str, needed: usize },

    /// A tagged field carried a value of the wrong length
    #[error("Bad length for field tag {tag:#04x}: got {len} bytes")]
    BadFieldLength { tag: u8, len: usize },

    /// A string field was not valid UTF-8
    #[error("Invalid UTF-8 in {0} field")]
    InvalidUtf8(&'static str),

    /// A field value does not fit the one-byte length prefix
    #[error("Field value too long: {len} bytes exceeds 255")]
    FieldTooLong { len: usize },

    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
