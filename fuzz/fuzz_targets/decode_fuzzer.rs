//! Fuzz target for the CoAP codec
//!
//! The receive loop feeds raw datagrams straight into the decoder, so the
//! decoder must hold up against anything the network produces.
//!
//! # Invariants
//!
//! - `Message::decode` NEVER panics on arbitrary bytes
//! - a decoded message that re-encodes must decode back to itself
//!   (re-encoding may fail for wire-legal options exceeding semantic
//!   bounds; that is a valid outcome, not a crash)
//! - decoded options appear in ascending option-number order

#![no_main]

use cairn_proto::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = Message::decode(data) else {
        return;
    };

    let ascending = message.options.windows(2).all(|pair| pair[0].number <= pair[1].number);
    assert!(ascending, "decoded options out of order: {:?}", message.options);

    if let Ok(bytes) = message.encode() {
        let reparsed = Message::decode(&bytes).expect("re-encoded message must decode");
        assert_eq!(reparsed, message, "re-encode changed the message");
    }
});
