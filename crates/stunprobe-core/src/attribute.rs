//! Typed message attributes.
//!
//! An attribute is a 16-bit type, a 16-bit value length and the value bytes.
//! The codec never pads values; the construction helpers here pad
//! string-valued attributes to a 4-byte boundary before they are inserted.

use crate::error::ErrorCode;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Size of the attribute type + length prefix
pub const ATTRIBUTE_HEADER_SIZE: usize = 4;

/// Length of an IPv4 address attribute value
pub const ADDRESS_VALUE_SIZE: usize = 8;

/// IPv4 address family marker inside address attributes
const FAMILY_IPV4: u8 = 0x01;

/// CHANGE-REQUEST bit asking for a different source port
const CHANGE_PORT_FLAG: u8 = 0x02;

/// CHANGE-REQUEST bit asking for a different source address
const CHANGE_ADDRESS_FLAG: u8 = 0x04;

/// Attribute type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// 0x0001
    MappedAddress,
    /// 0x0002
    ResponseAddress,
    /// 0x0003
    ChangeRequest,
    /// 0x0004
    SourceAddress,
    /// 0x0005
    ChangedAddress,
    /// 0x0006
    Username,
    /// 0x0007
    Password,
    /// 0x0008
    MessageIntegrity,
    /// 0x0009
    ErrorCode,
    /// 0x000a
    UnknownAttributes,
    /// 0x000b
    ReflectedFrom,
    /// Any other code, kept verbatim so it re-encodes unchanged
    Other(u16),
}

impl AttributeType {
    /// Wire value
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::MappedAddress => 0x0001,
            Self::ResponseAddress => 0x0002,
            Self::ChangeRequest => 0x0003,
            Self::SourceAddress => 0x0004,
            Self::ChangedAddress => 0x0005,
            Self::Username => 0x0006,
            Self::Password => 0x0007,
            Self::MessageIntegrity => 0x0008,
            Self::ErrorCode => 0x0009,
            Self::UnknownAttributes => 0x000a,
            Self::ReflectedFrom => 0x000b,
            Self::Other(code) => code,
        }
    }

    /// True for the five attributes holding an 8-byte address
    #[must_use]
    pub fn is_address(self) -> bool {
        matches!(
            self,
            Self::MappedAddress
                | Self::ResponseAddress
                | Self::SourceAddress
                | Self::ChangedAddress
                | Self::ReflectedFrom
        )
    }
}

impl From<u16> for AttributeType {
    fn from(code: u16) -> Self {
        match code {
            0x0001 => Self::MappedAddress,
            0x0002 => Self::ResponseAddress,
            0x0003 => Self::ChangeRequest,
            0x0004 => Self::SourceAddress,
            0x0005 => Self::ChangedAddress,
            0x0006 => Self::Username,
            0x0007 => Self::Password,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000a => Self::UnknownAttributes,
            0x000b => Self::ReflectedFrom,
            other => Self::Other(other),
        }
    }
}

/// Decoded CHANGE-REQUEST flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeFlags {
    /// Reply from the alternate address
    pub change_address: bool,
    /// Reply from the alternate port
    pub change_port: bool,
}

/// ERROR-CODE contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    /// Numeric code (class * 100 + number)
    pub code: u16,
    /// Reason phrase with padding stripped
    pub reason: String,
}

/// A single message attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    attr_type: AttributeType,
    value: Vec<u8>,
}

impl Attribute {
    /// Create an attribute from raw parts
    #[must_use]
    pub fn new(attr_type: AttributeType, value: Vec<u8>) -> Self {
        Self { attr_type, value }
    }

    /// Build an IPv4 address attribute
    ///
    /// Layout: reserved byte, family (0x01), port, four address bytes.
    #[must_use]
    pub fn address(attr_type: AttributeType, addr: SocketAddrV4) -> Self {
        let mut value = Vec::with_capacity(ADDRESS_VALUE_SIZE);
        value.push(0);
        value.push(FAMILY_IPV4);
        value.extend_from_slice(&addr.port().to_be_bytes());
        value.extend_from_slice(&addr.ip().octets());
        Self::new(attr_type, value)
    }

    /// Build a CHANGE-REQUEST attribute
    #[must_use]
    pub fn change_request(change_address: bool, change_port: bool) -> Self {
        let mut flags = 0u8;
        if change_address {
            flags |= CHANGE_ADDRESS_FLAG;
        }
        if change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        Self::new(AttributeType::ChangeRequest, vec![0, 0, 0, flags])
    }

    /// Build a USERNAME attribute, zero-padded to a 4-byte boundary
    #[must_use]
    pub fn username(username: &str) -> Self {
        Self::new(AttributeType::Username, pad4(username.as_bytes(), 0))
    }

    /// Build a PASSWORD attribute, zero-padded to a 4-byte boundary
    #[must_use]
    pub fn password(password: &[u8]) -> Self {
        Self::new(AttributeType::Password, pad4(password, 0))
    }

    /// Build an ERROR-CODE attribute with the canonical reason phrase
    #[must_use]
    pub fn error_code(code: ErrorCode) -> Self {
        Self::error_code_with_reason(code.code(), code.reason())
    }

    /// Build an ERROR-CODE attribute with a custom reason phrase
    ///
    /// The reason is space-padded to a 4-byte boundary.
    #[must_use]
    pub fn error_code_with_reason(code: u16, reason: &str) -> Self {
        let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
        value.extend_from_slice(&pad4(reason.as_bytes(), b' '));
        Self::new(AttributeType::ErrorCode, value)
    }

    /// Attribute type
    #[must_use]
    pub fn attr_type(&self) -> AttributeType {
        self.attr_type
    }

    /// Raw value bytes
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Encoded size including the 4-byte prefix
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ATTRIBUTE_HEADER_SIZE + self.value.len()
    }

    /// Interpret an address attribute value
    ///
    /// Returns `None` for non-address types, short values and non-IPv4
    /// families.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddrV4> {
        if !self.attr_type.is_address() || self.value.len() < ADDRESS_VALUE_SIZE {
            return None;
        }
        if self.value[1] != FAMILY_IPV4 {
            return None;
        }
        let port = u16::from_be_bytes([self.value[2], self.value[3]]);
        let ip = Ipv4Addr::new(self.value[4], self.value[5], self.value[6], self.value[7]);
        Some(SocketAddrV4::new(ip, port))
    }

    /// Same as [`Attribute::socket_addr`] but widened to `SocketAddr`
    #[must_use]
    pub fn addr(&self) -> Option<SocketAddr> {
        self.socket_addr().map(SocketAddr::V4)
    }

    /// Interpret a CHANGE-REQUEST value
    #[must_use]
    pub fn change_flags(&self) -> Option<ChangeFlags> {
        if self.attr_type != AttributeType::ChangeRequest || self.value.len() < 4 {
            return None;
        }
        let flags = self.value[3];
        Some(ChangeFlags {
            change_address: flags & CHANGE_ADDRESS_FLAG != 0,
            change_port: flags & CHANGE_PORT_FLAG != 0,
        })
    }

    /// Interpret an ERROR-CODE value
    #[must_use]
    pub fn error(&self) -> Option<ErrorValue> {
        if self.attr_type != AttributeType::ErrorCode || self.value.len() < 4 {
            return None;
        }
        let code = u16::from(self.value[2] & 0x07) * 100 + u16::from(self.value[3]);
        let reason = String::from_utf8_lossy(&self.value[4..])
            .trim_end_matches([' ', '\0'])
            .to_string();
        Some(ErrorValue { code, reason })
    }

    /// Interpret a USERNAME value, dropping trailing padding
    #[must_use]
    pub fn username_str(&self) -> Option<String> {
        if self.attr_type != AttributeType::Username || self.value.is_empty() {
            return None;
        }
        let name = String::from_utf8_lossy(&self.value)
            .trim_end_matches(['\0', ' '])
            .to_string();
        Some(name)
    }

    /// PASSWORD value bytes
    #[must_use]
    pub fn password_bytes(&self) -> Option<&[u8]> {
        if self.attr_type != AttributeType::Password || self.value.is_empty() {
            return None;
        }
        Some(&self.value)
    }

    /// Serialize into `out`
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attr_type.code().to_be_bytes());
        out.extend_from_slice(&(self.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.value);
    }
}

/// Right-pad `bytes` with `fill` to the next multiple of four
fn pad4(bytes: &[u8], fill: u8) -> Vec<u8> {
    let padding = (4 - bytes.len() % 4) % 4;
    let mut padded = Vec::with_capacity(bytes.len() + padding);
    padded.extend_from_slice(bytes);
    padded.extend(std::iter::repeat_n(fill, padding));
    padded
}
