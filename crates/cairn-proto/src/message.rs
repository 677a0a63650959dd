//! CoAP message type and wire serialization.

use std::fmt;

use bytes::Bytes;

use crate::{
    error::FormatError,
    option::{self, MessageOption, numbers},
    token::Token,
};

/// The only CoAP protocol version this codec speaks.
pub const VERSION: u8 = 1;

/// Byte separating the option list from the payload.
const PAYLOAD_MARKER: u8 = 0xFF;

/// Message type from the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Requires acknowledgement; subject to retransmission.
    Confirmable,
    /// Fire-and-forget.
    NonConfirmable,
    /// Acknowledges a confirmable message by message-id.
    Acknowledgement,
    /// Rejects a message by message-id.
    Reset,
}

impl MessageKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

/// Request method or response status in the 8-bit `class.detail` space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    /// 0.00, carried by empty ACK and Reset messages.
    pub const EMPTY: Self = Self(0x00);
    /// 0.01 GET.
    pub const GET: Self = Self(0x01);
    /// 0.02 POST.
    pub const POST: Self = Self(0x02);
    /// 0.03 PUT.
    pub const PUT: Self = Self(0x03);
    /// 0.04 DELETE.
    pub const DELETE: Self = Self(0x04);
    /// 2.01 Created.
    pub const CREATED: Self = Self(0x41);
    /// 2.04 Changed.
    pub const CHANGED: Self = Self(0x44);
    /// 2.05 Content.
    pub const CONTENT: Self = Self(0x45);
    /// 4.00 Bad Request.
    pub const BAD_REQUEST: Self = Self(0x80);
    /// 4.04 Not Found.
    pub const NOT_FOUND: Self = Self(0x84);
    /// 4.05 Method Not Allowed.
    pub const METHOD_NOT_ALLOWED: Self = Self(0x85);
    /// 5.00 Internal Server Error.
    pub const INTERNAL_SERVER_ERROR: Self = Self(0xA0);

    /// Build a code from its class (0-7) and detail (0-31) parts.
    pub fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1F))
    }

    /// Raw wire byte.
    pub fn byte(self) -> u8 {
        self.0
    }

    /// Code class (the `c` of `c.dd`).
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Code detail (the `dd` of `c.dd`).
    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// True for 0.00.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True for request methods (class 0, nonzero detail).
    pub fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    /// True for any response status (class 2, 4, or 5).
    pub fn is_response(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }

    /// True for 2.xx success statuses.
    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl From<u8> for Code {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A decoded CoAP message.
///
/// Field order mirrors the wire: fixed header, token, options, payload.
/// Options added through [`Message::push_option`] are kept sorted by
/// option number (insertion order preserved among equal numbers), matching
/// the ascending order the wire format requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub kind: MessageKind,
    /// Request method or response status.
    pub code: Code,
    /// 16-bit message-id, unique per sender within the dedup window.
    pub message_id: u16,
    /// Request/response correlator.
    pub token: Token,
    /// Option list in ascending option-number order.
    pub options: Vec<MessageOption>,
    /// Payload bytes; empty means no payload on the wire.
    pub payload: Bytes,
}

impl Message {
    /// Create a message with no token, options, or payload.
    pub fn new(kind: MessageKind, code: Code, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Token::EMPTY,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Empty acknowledgement for the given message-id.
    pub fn ack(message_id: u16) -> Self {
        Self::new(MessageKind::Acknowledgement, Code::EMPTY, message_id)
    }

    /// Reset rejecting the given message-id.
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageKind::Reset, Code::EMPTY, message_id)
    }

    /// Insert an option, keeping the list sorted by number (stable among
    /// equal numbers, so repeated Uri-Path segments stay in order).
    pub fn push_option(&mut self, opt: MessageOption) {
        let at = self.options.partition_point(|o| o.number <= opt.number);
        self.options.insert(at, opt);
    }

    /// First option with the given number.
    pub fn option(&self, number: u16) -> Option<&MessageOption> {
        self.options.iter().find(|o| o.number == number)
    }

    /// Observe option value, if present (RFC 7641 24-bit sequence).
    pub fn observe(&self) -> Option<u32> {
        self.option(numbers::OBSERVE).and_then(MessageOption::value_as_uint)
    }

    /// Content-Format option value, if present.
    pub fn content_format(&self) -> Option<u16> {
        self.option(numbers::CONTENT_FORMAT)
            .and_then(MessageOption::value_as_uint)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Uri-Path segments joined with `/`.
    pub fn uri_path(&self) -> String {
        let segments: Vec<&str> = self
            .options
            .iter()
            .filter(|o| o.number == numbers::URI_PATH)
            .map(|o| std::str::from_utf8(&o.value).unwrap_or(""))
            .collect();
        segments.join("/")
    }

    /// Append Uri-Path options for each `/`-separated segment of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::OptionTooLong`] if a segment exceeds 255
    /// bytes.
    pub fn set_uri_path(&mut self, path: &str) -> Result<(), FormatError> {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.push_option(MessageOption::new(numbers::URI_PATH, segment.as_bytes().to_vec())?);
        }
        Ok(())
    }

    /// Serialize to a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if an option value exceeds its defined
    /// length bound.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::with_capacity(4 + self.token.len() + 16 + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Serialize, appending to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if an option value exceeds its defined
    /// length bound.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), FormatError> {
        buf.push((VERSION << 6) | (self.kind.bits() << 4) | self.token.len() as u8);
        buf.push(self.code.byte());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(self.token.as_slice());

        // Options must appear in ascending number order; sort a view so a
        // caller that filled `options` directly still encodes correctly.
        let mut sorted: Vec<&MessageOption> = self.options.iter().collect();
        sorted.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for opt in sorted {
            let max = option::max_value_len(opt.number);
            if opt.value.len() > max {
                return Err(FormatError::OptionTooLong {
                    number: opt.number,
                    len: opt.value.len(),
                    max,
                });
            }

            let delta = usize::from(opt.number - previous);
            let (delta_nibble, delta_ext) = split_field(delta);
            let (len_nibble, len_ext) = split_field(opt.value.len());

            buf.push((delta_nibble << 4) | len_nibble);
            push_ext(buf, delta_ext);
            push_ext(buf, len_ext);
            buf.extend_from_slice(&opt.value);

            previous = opt.number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }

        Ok(())
    }

    /// Parse a datagram.
    ///
    /// Options are yielded in the ascending order they appear on the wire;
    /// no semantic validation is applied beyond structural bounds.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if the version is unsupported, the declared
    /// token length is inconsistent with the buffer, or the option/payload
    /// encoding overruns the buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < 4 {
            return Err(FormatError::HeaderTooShort { len: bytes.len() });
        }

        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let kind = MessageKind::from_bits(bytes[0] >> 4);
        let token_len = usize::from(bytes[0] & 0x0F);
        if token_len > Token::MAX_LEN {
            return Err(FormatError::ReservedTokenLength(token_len as u8));
        }

        let code = Code::from(bytes[1]);
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut at = 4;
        if bytes.len() < at + token_len {
            return Err(FormatError::TruncatedToken {
                declared: token_len,
                available: bytes.len() - at,
            });
        }
        let token = Token::new(&bytes[at..at + token_len])?;
        at += token_len;

        let mut options = Vec::new();
        let mut payload = Bytes::new();
        let mut number = 0u16;

        while at < bytes.len() {
            let first = bytes[at];
            if first == PAYLOAD_MARKER {
                at += 1;
                if at == bytes.len() {
                    return Err(FormatError::EmptyPayload);
                }
                payload = Bytes::copy_from_slice(&bytes[at..]);
                break;
            }
            at += 1;

            let delta_nibble = first >> 4;
            let len_nibble = first & 0x0F;
            if delta_nibble == 15 || len_nibble == 15 {
                return Err(FormatError::ReservedOptionNibble);
            }

            let delta = read_ext(bytes, &mut at, delta_nibble)?;
            let value_len = read_ext(bytes, &mut at, len_nibble)?;

            number = u32::from(number)
                .checked_add(delta as u32)
                .filter(|&n| n <= u32::from(u16::MAX))
                .map(|n| n as u16)
                .ok_or(FormatError::OptionDeltaOverflow)?;

            if bytes.len() < at + value_len {
                return Err(FormatError::TruncatedOption);
            }
            options.push(MessageOption { number, value: bytes[at..at + value_len].to_vec() });
            at += value_len;
        }

        Ok(Self { kind, code, message_id, token, options, payload })
    }
}

/// Split a delta or length into its 4-bit nibble and extended encoding.
fn split_field(value: usize) -> (u8, Ext) {
    if value < 13 {
        (value as u8, Ext::None)
    } else if value < 269 {
        (13, Ext::One((value - 13) as u8))
    } else {
        (14, Ext::Two((value - 269) as u16))
    }
}

/// Extended delta/length bytes following the option header byte.
enum Ext {
    None,
    One(u8),
    Two(u16),
}

fn push_ext(buf: &mut Vec<u8>, ext: Ext) {
    match ext {
        Ext::None => {},
        Ext::One(b) => buf.push(b),
        Ext::Two(v) => buf.extend_from_slice(&v.to_be_bytes()),
    }
}

/// Read the extended delta/length bytes selected by `nibble`.
fn read_ext(bytes: &[u8], at: &mut usize, nibble: u8) -> Result<usize, FormatError> {
    match nibble {
        13 => {
            let b = *bytes.get(*at).ok_or(FormatError::TruncatedOption)?;
            *at += 1;
            Ok(usize::from(b) + 13)
        },
        14 => {
            if bytes.len() < *at + 2 {
                return Err(FormatError::TruncatedOption);
            }
            let v = u16::from_be_bytes([bytes[*at], bytes[*at + 1]]);
            *at += 2;
            Ok(usize::from(v) + 269)
        },
        n => Ok(usize::from(n)),
    }
}
