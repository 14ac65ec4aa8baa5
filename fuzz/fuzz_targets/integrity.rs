//! Fuzz target for MESSAGE-INTEGRITY verification
//!
//! Verification against an arbitrary password never panics, and a message
//! signed with that password always verifies.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stunprobe_core::{Attribute, MessageClass, MessageHeader};

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    datagram: &'a [u8],
    password: &'a [u8],
    username: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    if let Ok(message) = MessageHeader::decode(input.datagram) {
        let _ = message.verify_message_integrity(input.password);
    }

    let mut request = MessageHeader::with_generated_id(MessageClass::BindingRequest);
    request.add_attribute(Attribute::username(input.username));
    if request.add_message_integrity(input.password).is_ok() {
        assert!(request.verify_message_integrity(input.password).is_ok());
    }
});
