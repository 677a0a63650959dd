//! Request/response correlation token.

use std::fmt;

use crate::error::FormatError;

/// Opaque 0-8 byte token correlating a response to its originating request,
/// independent of message-id.
///
/// Stored inline so tokens are `Copy` and usable as map keys without
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    len: u8,
    bytes: [u8; Self::MAX_LEN],
}

impl Token {
    /// Maximum token length permitted by the wire format.
    pub const MAX_LEN: usize = 8;

    /// The zero-length token used by empty messages.
    pub const EMPTY: Self = Self { len: 0, bytes: [0; Self::MAX_LEN] };

    /// Create a token from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::TokenTooLong`] if `bytes` exceeds 8 bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() > Self::MAX_LEN {
            return Err(FormatError::TokenTooLong(bytes.len()));
        }

        let mut token = Self { len: bytes.len() as u8, bytes: [0; Self::MAX_LEN] };
        token.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(token)
    }

    /// The token bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Token length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the zero-length token.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
