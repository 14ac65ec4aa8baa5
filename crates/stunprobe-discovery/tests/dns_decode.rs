//! Property tests for DNS reply parsing

use proptest::prelude::*;
use stunprobe_discovery::dns::{DnsMessage, RecordClass, RecordType, encode_query};

proptest! {
    /// Arbitrary bytes never panic the decoder
    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = DnsMessage::decode(&bytes);
    }

    /// Our own queries parse back with the question intact
    #[test]
    fn prop_query_parses(
        id in any::<u16>(),
        labels in prop::collection::vec("[a-z0-9]{1,20}", 1..5),
    ) {
        let name = labels.join(".");
        let query = encode_query(id, &name, RecordType::Srv, RecordClass::In).unwrap();
        let message = DnsMessage::decode(&query).unwrap();

        prop_assert_eq!(message.id, id);
        prop_assert_eq!(message.questions.len(), 1);
        prop_assert_eq!(&message.questions[0].name, &name);
        prop_assert_eq!(message.questions[0].rtype, RecordType::Srv);
        prop_assert!(message.answers.is_empty());
    }

    /// Truncating a valid query anywhere inside it is an error, not a panic
    #[test]
    fn prop_truncated_query_rejected(cut in 0usize..30) {
        let query = encode_query(7, "_stun._udp.example.org", RecordType::Srv, RecordClass::In).unwrap();
        let cut = cut.min(query.len() - 1);
        prop_assert!(DnsMessage::decode(&query[..cut]).is_err());
    }
}
