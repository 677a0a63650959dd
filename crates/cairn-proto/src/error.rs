//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding a CoAP message.
///
/// Decode errors mean the datagram is malformed and must be dropped; they
/// are never fatal to the receive path. Encode errors indicate the caller
/// built a message that cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Datagram is shorter than the 4-byte fixed header.
    #[error("datagram too short for fixed header: {len} bytes")]
    HeaderTooShort {
        /// Number of bytes actually available.
        len: usize,
    },

    /// Version field is not the supported CoAP version 1.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Token length nibble is in the reserved 9-15 range.
    #[error("reserved token length {0}")]
    ReservedTokenLength(u8),

    /// Declared token length exceeds the remaining buffer.
    #[error("token length {declared} exceeds remaining {available} bytes")]
    TruncatedToken {
        /// Token length declared in the header.
        declared: usize,
        /// Bytes remaining after the header.
        available: usize,
    },

    /// Option delta/length encoding runs past the end of the buffer.
    #[error("option encoding overruns the buffer")]
    TruncatedOption,

    /// Option delta or length nibble is the reserved value 15 outside the
    /// payload marker byte.
    #[error("reserved option nibble 15")]
    ReservedOptionNibble,

    /// Accumulated option number exceeds the 16-bit option number space.
    #[error("option delta overflows the option number space")]
    OptionDeltaOverflow,

    /// Payload marker present but no payload bytes follow.
    #[error("payload marker with empty payload")]
    EmptyPayload,

    /// Token longer than the 8-byte wire maximum.
    #[error("token length {0} exceeds the 8-byte maximum")]
    TokenTooLong(usize),

    /// Option value exceeds the length bound defined for its number.
    #[error("option {number} value is {len} bytes, bound is {max}")]
    OptionTooLong {
        /// Option number.
        number: u16,
        /// Actual value length.
        len: usize,
        /// Maximum permitted value length for this option.
        max: usize,
    },
}
