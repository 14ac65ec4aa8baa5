//! # stunprobe Core
//!
//! Wire protocol for classic STUN (RFC 3489) NAT discovery.
//!
//! This crate provides:
//! - Message header and attribute encoding/decoding
//! - HMAC-SHA1 (standard and short-block variants)
//! - MESSAGE-INTEGRITY attach and verify
//! - Protocol error codes and reason phrases
//!
//! It does no I/O; the discovery crate drives sockets on top of it.
//!
//! ## Example
//!
//! ```rust
//! use stunprobe_core::{Attribute, AttributeType, MessageClass, MessageHeader};
//!
//! let mut request = MessageHeader::with_generated_id(MessageClass::BindingRequest);
//! request.add_attribute(Attribute::username("USER-18c2b1a7e0f0"));
//! request.add_message_integrity(b"secret").unwrap();
//!
//! let wire = request.encode().unwrap();
//! let decoded = MessageHeader::decode(&wire).unwrap();
//! assert!(decoded.verify_message_integrity(b"secret").is_ok());
//! assert!(decoded.has_attribute(AttributeType::MessageIntegrity));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod error;
pub mod integrity;
pub mod mac;
pub mod message;

pub use attribute::{Attribute, AttributeType, ChangeFlags, ErrorValue};
pub use error::{CodecError, ErrorCode, IntegrityError};
pub use integrity::INTEGRITY_ATTRIBUTE_SIZE;
pub use mac::{hmac_sha1, hmac_sha1_with_block_size};
pub use message::{MessageClass, MessageHeader, TransactionId};

/// Fixed message header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Largest body the 16-bit length field can describe
pub const MAX_BODY_LENGTH: usize = 0xffff;

/// Largest complete message
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + MAX_BODY_LENGTH;

/// Default server port for both UDP binding and TLS shared secrets
pub const DEFAULT_PORT: u16 = 3478;
