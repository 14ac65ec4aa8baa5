//! MESSAGE-INTEGRITY computation and verification.
//!
//! The MAC input is the serialized header plus every attribute preceding
//! MESSAGE-INTEGRITY, with the length field already counting the 24-byte
//! integrity attribute itself. MESSAGE-INTEGRITY is always appended last.

use crate::attribute::{ATTRIBUTE_HEADER_SIZE, Attribute, AttributeType};
use crate::error::{CodecError, IntegrityError};
use crate::mac::{HMAC_SHA1_LEN, hmac_sha1};
use crate::message::{MessageClass, MessageHeader};

/// Encoded size of a MESSAGE-INTEGRITY attribute
pub const INTEGRITY_ATTRIBUTE_SIZE: usize = ATTRIBUTE_HEADER_SIZE + HMAC_SHA1_LEN;

impl MessageHeader {
    /// Append a MESSAGE-INTEGRITY attribute keyed with `password`
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the message including the integrity
    /// attribute would not fit the length field.
    pub fn add_message_integrity(&mut self, password: &[u8]) -> Result<(), CodecError> {
        let declared = self.body_len() + INTEGRITY_ATTRIBUTE_SIZE;
        let input = self.encode_prefix(self.attributes().len(), declared)?;
        let mac = hmac_sha1(password, &input);
        self.add_attribute(Attribute::new(AttributeType::MessageIntegrity, mac.to_vec()));
        Ok(())
    }

    /// Consume `self` and return it with MESSAGE-INTEGRITY attached
    ///
    /// # Errors
    ///
    /// Same as [`MessageHeader::add_message_integrity`].
    pub fn with_message_integrity(mut self, password: &[u8]) -> Result<Self, CodecError> {
        self.add_message_integrity(password)?;
        Ok(self)
    }

    /// Verify the MESSAGE-INTEGRITY attribute against `password`
    ///
    /// A SharedSecretVerifyRequest is checked as if it were the
    /// BindingRequest it was copied from, since that is what the client
    /// signed.
    ///
    /// # Errors
    ///
    /// - [`IntegrityError::Missing`] if there is no integrity attribute (401)
    /// - [`IntegrityError::Serialize`] if the header cannot be re-encoded (400)
    /// - [`IntegrityError::Mismatch`] if the MAC differs (431)
    pub fn verify_message_integrity(&self, password: &[u8]) -> Result<(), IntegrityError> {
        let index = self
            .attributes()
            .iter()
            .position(|a| a.attr_type() == AttributeType::MessageIntegrity)
            .ok_or(IntegrityError::Missing)?;

        let received = &self.attributes()[index];
        let declared: usize = self.attributes()[..index]
            .iter()
            .map(Attribute::encoded_len)
            .sum::<usize>()
            + received.encoded_len();

        let mut input = self.encode_prefix(index, declared)?;
        if self.class() == MessageClass::SharedSecretVerifyRequest {
            input[..2].copy_from_slice(&MessageClass::BindingRequest.code().to_be_bytes());
        }

        let computed = hmac_sha1(password, &input);
        if received.value().len() != HMAC_SHA1_LEN || !constant_time_eq(&computed, received.value())
        {
            tracing::debug!(
                transaction_id = %self.transaction_id(),
                "message integrity mismatch"
            );
            return Err(IntegrityError::Mismatch);
        }

        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD: &[u8] = b"0123456789abcdefghij";

    fn request() -> MessageHeader {
        let mut header = MessageHeader::with_generated_id(MessageClass::BindingRequest);
        header.add_attribute(Attribute::username("USER-18c2b1a7e0f0"));
        header
    }

    #[test]
    fn test_attach_appends_last() {
        let header = request().with_message_integrity(PASSWORD).unwrap();
        let last = header.attributes().last().unwrap();
        assert_eq!(last.attr_type(), AttributeType::MessageIntegrity);
        assert_eq!(last.value().len(), 20);
    }

    #[test]
    fn test_mac_covers_prefix_with_final_length() {
        let header = request().with_message_integrity(PASSWORD).unwrap();
        let wire = header.encode().unwrap();

        let prefix = &wire[..wire.len() - INTEGRITY_ATTRIBUTE_SIZE];
        assert_eq!(hmac_sha1(PASSWORD, prefix).as_slice(), &wire[wire.len() - 20..]);
    }

    #[test]
    fn test_verify_roundtrip() {
        let header = request().with_message_integrity(PASSWORD).unwrap();
        assert_eq!(header.verify_message_integrity(PASSWORD), Ok(()));

        let decoded = MessageHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(decoded.verify_message_integrity(PASSWORD), Ok(()));
    }

    #[test]
    fn test_verify_wrong_password() {
        let header = request().with_message_integrity(PASSWORD).unwrap();
        assert_eq!(
            header.verify_message_integrity(b"not the password"),
            Err(IntegrityError::Mismatch)
        );
    }

    #[test]
    fn test_verify_missing() {
        let err = request().verify_message_integrity(PASSWORD).unwrap_err();
        assert_eq!(err, IntegrityError::Missing);
        assert_eq!(err.error_code().code(), 401);
    }

    #[test]
    fn test_verify_request_checked_as_binding_request() {
        let signed = request().with_message_integrity(PASSWORD).unwrap();
        let mut forwarded = signed.clone();
        forwarded.set_class(MessageClass::SharedSecretVerifyRequest);

        assert_eq!(forwarded.verify_message_integrity(PASSWORD), Ok(()));

        let mut other = signed;
        other.set_class(MessageClass::SharedSecretRequest);
        assert_eq!(
            other.verify_message_integrity(PASSWORD),
            Err(IntegrityError::Mismatch)
        );
    }

    #[test]
    fn test_attach_overflow() {
        let mut header = MessageHeader::new(MessageClass::BindingRequest);
        header.add_attribute(Attribute::new(AttributeType::Other(0x4000), vec![0; 65_520]));
        assert!(matches!(
            header.add_message_integrity(PASSWORD),
            Err(CodecError::LengthOverflow(_))
        ));
    }
}
