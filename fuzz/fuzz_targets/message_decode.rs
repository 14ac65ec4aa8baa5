//! Fuzz target for STUN message decoding
//!
//! Arbitrary datagrams must decode to Ok or Err, and anything that decodes
//! must encode again.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stunprobe_core::{AttributeType, HEADER_SIZE, MessageHeader};

fuzz_target!(|data: &[u8]| {
    if data.len() >= HEADER_SIZE {
        let _ = MessageHeader::peek_body_len(&data[..HEADER_SIZE]);
    }

    let Ok(message) = MessageHeader::decode(data) else {
        return;
    };

    // Typed accessors must tolerate whatever value bytes arrived
    for attribute in message.attributes() {
        let _ = attribute.socket_addr();
        let _ = attribute.change_flags();
        let _ = attribute.error();
        let _ = attribute.username_str();
        let _ = attribute.password_bytes();
    }
    let _ = message.address(AttributeType::MappedAddress);

    let encoded = message.encode().expect("decoded message re-encodes");
    let again = MessageHeader::decode(&encoded).expect("re-encoded message decodes");
    assert_eq!(again.attributes(), message.attributes());
});
