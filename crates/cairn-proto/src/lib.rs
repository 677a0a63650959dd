//! CoAP wire codec.
//!
//! Stateless encoding and decoding of CoAP messages (RFC 7252) for the Cairn
//! telemetry collector: the 4-byte fixed header, the 0-8 byte token, the
//! delta-encoded option list, and the optional payload.
//!
//! # Architecture
//!
//! The codec is pure data-in/data-out:
//! - [`Message::decode`] parses a datagram or fails with [`FormatError`]
//! - [`Message::encode`] serializes a message or fails with [`FormatError`]
//!
//! Structural bounds (token length, option value lengths, buffer overruns)
//! are enforced here. Option *semantics* — which options make sense on which
//! message — are the caller's responsibility.
//!
//! # Components
//!
//! - [`Message`]: a decoded CoAP message
//! - [`MessageKind`]: Confirmable / NonConfirmable / Acknowledgement / Reset
//! - [`Code`]: request method or response status in `class.detail` form
//! - [`Token`]: inline 0-8 byte request/response correlator
//! - [`MessageOption`]: a single `{number, value}` option instance

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod message;
mod option;
mod token;

pub use error::FormatError;
pub use message::{Code, Message, MessageKind, VERSION};
pub use option::{MessageOption, content_format, numbers};
pub use token::Token;
