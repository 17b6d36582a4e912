//! Connection header error types.

use thiserror::Error;

/// Errors raised while decoding a connection header.
///
/// Every variant carries the byte offset (relative to the start of the
/// header, i.e. the first byte of the total-length prefix) where decoding
/// stopped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A length prefix or field record extends past the end of the input
    #[error("truncated header at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        /// Offset of the incomplete element
        offset: usize,
        /// Bytes required to complete it
        needed: usize,
        /// Bytes remaining in the input
        available: usize,
    },

    /// A field record has no `=` between name and value
    #[error("field record at offset {offset} has no '=' separator")]
    MissingSeparator {
        /// Offset of the field record body
        offset: usize,
    },

    /// A field record is not valid UTF-8 text
    #[error("field record at offset {offset} is not valid utf-8")]
    InvalidUtf8 {
        /// Offset of the field record body
        offset: usize,
    },

    /// Field records do not add up to the declared total length
    #[error("header declares {declared} bytes of fields but records span {consumed}")]
    LengthMismatch {
        /// Total length from the 4-byte prefix
        declared: usize,
        /// Bytes covered by the field records read so far
        consumed: usize,
    },
}

impl DecodeError {
    /// Byte offset at which decoding failed
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::Truncated { offset, .. }
            | DecodeError::MissingSeparator { offset }
            | DecodeError::InvalidUtf8 { offset } => *offset,
            // length prefix + records seen so far
            DecodeError::LengthMismatch { consumed, .. } => consumed.saturating_add(4),
        }
    }
}

/// Errors raised while encoding a connection header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Header or field length does not fit a 32-bit length prefix
    #[error("header length {len} does not fit a u32 length prefix")]
    TooLarge {
        /// Length that overflowed
        len: usize,
    },
}

/// Errors raised while moving a header over a byte stream
#[derive(Error, Debug)]
pub enum HeaderIoError {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Header bytes could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Declared header size exceeds the allowed maximum
    #[error("header size {0} exceeds limit")]
    TooLarge(usize),
}
