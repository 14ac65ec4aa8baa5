//! Fuzz target for DNS reply parsing
//!
//! Tests that compression pointers and truncated sections never panic the parser.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stunprobe_discovery::dns::{DnsMessage, servers_from_records};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = DnsMessage::decode(data) {
        let _ = message.rcode();
        let _ = servers_from_records(&message.answers);
    }
});
