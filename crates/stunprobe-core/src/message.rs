//! Message header encoding and decoding.
//!
//! Wire layout (all fields big-endian):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Message Class         |          Body Length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                   Transaction ID (128 bits)                   |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Attributes (type, length, value)...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::attribute::{ATTRIBUTE_HEADER_SIZE, Attribute, AttributeType, ErrorValue};
use crate::error::CodecError;
use crate::{HEADER_SIZE, MAX_BODY_LENGTH};
use rand::RngCore;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Message classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// 0x0001
    BindingRequest,
    /// 0x0101
    BindingResponse,
    /// 0x0111
    BindingErrorResponse,
    /// 0x0002
    SharedSecretRequest,
    /// 0x0102
    SharedSecretResponse,
    /// 0x0112
    SharedSecretErrorResponse,
    /// 0x8102
    SharedSecretVerifyRequest,
    /// Unrecognized class, raw value kept for re-encoding
    Unknown(u16),
}

impl MessageClass {
    /// Wire value
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::BindingRequest => 0x0001,
            Self::BindingResponse => 0x0101,
            Self::BindingErrorResponse => 0x0111,
            Self::SharedSecretRequest => 0x0002,
            Self::SharedSecretResponse => 0x0102,
            Self::SharedSecretErrorResponse => 0x0112,
            Self::SharedSecretVerifyRequest => 0x8102,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u16> for MessageClass {
    fn from(code: u16) -> Self {
        match code {
            0x0001 => Self::BindingRequest,
            0x0101 => Self::BindingResponse,
            0x0111 => Self::BindingErrorResponse,
            0x0002 => Self::SharedSecretRequest,
            0x0102 => Self::SharedSecretResponse,
            0x0112 => Self::SharedSecretErrorResponse,
            0x8102 => Self::SharedSecretVerifyRequest,
            other => Self::Unknown(other),
        }
    }
}

/// 128-bit transaction identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    /// Generate a fresh identifier
    ///
    /// Bytes 0-3 are zero, bytes 4-11 carry the current time in
    /// milliseconds and bytes 12-15 are random.
    #[must_use]
    pub fn generate() -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        let mut id = [0u8; 16];
        id[4..12].copy_from_slice(&now_ms.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut id[12..16]);
        Self(id)
    }

    /// Wrap raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A protocol message: class, transaction id and ordered attributes
///
/// Attributes keep insertion order, which is also wire order. Duplicate
/// types are allowed; lookups return the first match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    class: MessageClass,
    transaction_id: TransactionId,
    attributes: Vec<Attribute>,
    change_address: bool,
    change_port: bool,
}

impl MessageHeader {
    /// Create an empty message with a zero transaction id
    #[must_use]
    pub fn new(class: MessageClass) -> Self {
        Self {
            class,
            transaction_id: TransactionId::default(),
            attributes: Vec::new(),
            change_address: false,
            change_port: false,
        }
    }

    /// Create an empty message with a freshly generated transaction id
    #[must_use]
    pub fn with_generated_id(class: MessageClass) -> Self {
        let mut header = Self::new(class);
        header.transaction_id = TransactionId::generate();
        header
    }

    /// Message class
    #[must_use]
    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// Change the message class, keeping everything else
    pub fn set_class(&mut self, class: MessageClass) {
        self.class = class;
    }

    /// Transaction id
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Replace the transaction id
    pub fn set_transaction_id(&mut self, id: TransactionId) {
        self.transaction_id = id;
    }

    /// Attributes in wire order
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Append an attribute
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// First attribute of the given type
    #[must_use]
    pub fn attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type() == attr_type)
    }

    /// True if an attribute of the given type is present
    #[must_use]
    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.attribute(attr_type).is_some()
    }

    /// First address attribute of the given type as a socket address
    #[must_use]
    pub fn address(&self, attr_type: AttributeType) -> Option<SocketAddr> {
        self.attribute(attr_type).and_then(Attribute::addr)
    }

    /// Decoded ERROR-CODE, if present
    #[must_use]
    pub fn error(&self) -> Option<ErrorValue> {
        self.attribute(AttributeType::ErrorCode)
            .and_then(Attribute::error)
    }

    /// Responder-internal flag: reply must come from the alternate address
    #[must_use]
    pub fn change_address(&self) -> bool {
        self.change_address
    }

    /// Set the change-address flag (never serialized)
    pub fn set_change_address(&mut self, on: bool) {
        self.change_address = on;
    }

    /// Responder-internal flag: reply must come from a different port
    #[must_use]
    pub fn change_port(&self) -> bool {
        self.change_port
    }

    /// Set the change-port flag (never serialized)
    pub fn set_change_port(&mut self, on: bool) {
        self.change_port = on;
    }

    /// Sum of encoded attribute sizes
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.attributes.iter().map(Attribute::encoded_len).sum()
    }

    /// Encode to bytes
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LengthOverflow`] if the attributes do not fit
    /// the 16-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body_len = self.body_len();
        self.encode_prefix(self.attributes.len(), body_len)
    }

    /// Encode, leaving out every attribute of `skip`
    ///
    /// The length field still counts every attribute, skipped ones
    /// included, so the output is the MAC input a peer would reconstruct.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LengthOverflow`] if the full attribute list does
    /// not fit the 16-bit length field.
    pub fn encode_except(&self, skip: AttributeType) -> Result<Vec<u8>, CodecError> {
        let body_len = self.body_len();
        check_lengths(&self.attributes, body_len)?;

        let mut bytes = Vec::with_capacity(HEADER_SIZE + body_len);
        self.write_fixed_header(&mut bytes, body_len);
        for attr in self.attributes.iter().filter(|a| a.attr_type() != skip) {
            attr.write_to(&mut bytes);
        }
        Ok(bytes)
    }

    /// Encode the header and the first `count` attributes, with
    /// `declared_len` written into the length field
    pub(crate) fn encode_prefix(
        &self,
        count: usize,
        declared_len: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let attrs = &self.attributes[..count.min(self.attributes.len())];
        check_lengths(attrs, declared_len)?;

        let mut bytes = Vec::with_capacity(HEADER_SIZE + declared_len);
        self.write_fixed_header(&mut bytes, declared_len);
        for attr in attrs {
            attr.write_to(&mut bytes);
        }
        Ok(bytes)
    }

    fn write_fixed_header(&self, bytes: &mut Vec<u8>, body_len: usize) {
        bytes.extend_from_slice(&self.class.code().to_be_bytes());
        bytes.extend_from_slice(&(body_len as u16).to_be_bytes());
        bytes.extend_from_slice(self.transaction_id.as_bytes());
    }

    /// Decode from bytes
    ///
    /// Trailing bytes past the declared body length are ignored, so a
    /// full receive buffer can be passed directly.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is shorter than the fixed header, if the
    /// declared body runs past the buffer or if any attribute's declared
    /// length runs past the body.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::TooShort {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let class = MessageClass::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        let body_len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[4..HEADER_SIZE]);

        let available = bytes.len() - HEADER_SIZE;
        if body_len > available {
            return Err(CodecError::BodyOverrun {
                declared: body_len,
                available,
            });
        }

        let end = HEADER_SIZE + body_len;
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset < end {
            if offset + ATTRIBUTE_HEADER_SIZE > end {
                return Err(CodecError::TruncatedAttribute { offset });
            }

            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = usize::from(u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]));
            let value_start = offset + ATTRIBUTE_HEADER_SIZE;

            if value_start + attr_len > end {
                return Err(CodecError::AttributeOverrun {
                    offset,
                    declared: attr_len,
                    available: end - value_start,
                });
            }

            attributes.push(Attribute::new(
                AttributeType::from(attr_type),
                bytes[value_start..value_start + attr_len].to_vec(),
            ));
            offset = value_start + attr_len;
        }

        Ok(Self {
            class,
            transaction_id: TransactionId(id),
            attributes,
            change_address: false,
            change_port: false,
        })
    }

    /// Read the body length from a fixed header without decoding it
    ///
    /// Stream transports use this to learn how many bytes follow.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if fewer than 20 bytes are given.
    pub fn peek_body_len(header: &[u8]) -> Result<usize, CodecError> {
        if header.len() < HEADER_SIZE {
            return Err(CodecError::TooShort {
                expected: HEADER_SIZE,
                actual: header.len(),
            });
        }
        Ok(usize::from(u16::from_be_bytes([header[2], header[3]])))
    }
}

fn check_lengths(attrs: &[Attribute], body_len: usize) -> Result<(), CodecError> {
    if body_len > MAX_BODY_LENGTH {
        return Err(CodecError::LengthOverflow(body_len));
    }
    if let Some(attr) = attrs.iter().find(|a| a.value().len() > usize::from(u16::MAX)) {
        return Err(CodecError::AttributeTooLong(attr.value().len()));
    }
    Ok(())
}
