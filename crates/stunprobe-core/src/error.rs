//! Error types for the stunprobe wire protocol.
//!
//! Two families live here: local failures ([`CodecError`], [`IntegrityError`])
//! and the numeric protocol codes carried in ERROR-CODE attributes
//! ([`ErrorCode`]).

use thiserror::Error;

/// Encoding and decoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer shorter than the fixed header
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Sum of attribute lengths does not fit the 16-bit length field
    #[error("message length {0} exceeds 65535 bytes")]
    LengthOverflow(usize),

    /// Attribute value length exceeds the 16-bit attribute length field
    #[error("attribute value of {0} bytes exceeds 65535 bytes")]
    AttributeTooLong(usize),

    /// Header declares more body bytes than the buffer holds
    #[error("declared body length {declared} exceeds available {available} bytes")]
    BodyOverrun {
        /// Length from the header
        declared: usize,
        /// Bytes following the header
        available: usize,
    },

    /// Attribute value runs past the end of the body
    #[error("attribute at offset {offset} declares {declared} bytes, only {available} remain")]
    AttributeOverrun {
        /// Attribute offset inside the message
        offset: usize,
        /// Declared value length
        declared: usize,
        /// Bytes remaining in the body
        available: usize,
    },

    /// Fewer than four bytes left for an attribute header
    #[error("truncated attribute header at offset {offset}")]
    TruncatedAttribute {
        /// Attribute offset inside the message
        offset: usize,
    },
}

/// MESSAGE-INTEGRITY verification failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// No MESSAGE-INTEGRITY attribute present
    #[error("message integrity attribute missing")]
    Missing,

    /// The header could not be re-serialized for MAC computation
    #[error("cannot serialize message for integrity check: {0}")]
    Serialize(#[from] CodecError),

    /// Received MAC does not match the computed one
    #[error("message integrity mismatch")]
    Mismatch,
}

impl IntegrityError {
    /// Wire error code for this failure
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Missing => ErrorCode::Unauthorized,
            Self::Serialize(_) => ErrorCode::BadRequest,
            Self::Mismatch => ErrorCode::IntegrityCheckFailure,
        }
    }
}

/// Protocol error codes
///
/// Codes below 700 travel on the wire inside ERROR-CODE attributes. 700 is
/// only ever produced locally by a client that received something it could
/// not use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 400
    BadRequest,
    /// 401
    Unauthorized,
    /// 420
    UnknownAttribute,
    /// 430
    StaleCredentials,
    /// 431
    IntegrityCheckFailure,
    /// 432
    MissingUsername,
    /// 433
    UseTls,
    /// 500
    ServerError,
    /// 600
    GlobalFailure,
    /// 700, client-local
    ClientFailure,
}

impl ErrorCode {
    /// Numeric code
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::UnknownAttribute => 420,
            Self::StaleCredentials => 430,
            Self::IntegrityCheckFailure => 431,
            Self::MissingUsername => 432,
            Self::UseTls => 433,
            Self::ServerError => 500,
            Self::GlobalFailure => 600,
            Self::ClientFailure => 700,
        }
    }

    /// Map a numeric code back to a known variant
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            420 => Self::UnknownAttribute,
            430 => Self::StaleCredentials,
            431 => Self::IntegrityCheckFailure,
            432 => Self::MissingUsername,
            433 => Self::UseTls,
            500 => Self::ServerError,
            600 => Self::GlobalFailure,
            700 => Self::ClientFailure,
            _ => return None,
        })
    }

    /// Canonical reason phrase sent alongside the code
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Unauthorized => {
                "(Unauthorized): The Binding Request did not contain a MESSAGE-INTEGRITY attribute."
            }
            Self::UnknownAttribute => {
                "(Unknown Attribute): The server did not understand a mandatory attribute in the request."
            }
            Self::StaleCredentials => {
                "(Stale Credentials): The Binding Request did contain a MESSAGE-INTEGRITY attribute, \
                 but it used a shared secret that has expired. The client should obtain a new shared \
                 secret and try again."
            }
            Self::IntegrityCheckFailure => {
                "(Integrity Check Failure): The Binding Request contained a MESSAGE-INTEGRITY \
                 attribute, but the HMAC failed verification. This could be a sign of a potential \
                 attack, or client implementation error."
            }
            Self::MissingUsername => {
                "(Missing Username): The Binding Request contained a MESSAGE-INTEGRITY attribute, \
                 but not a USERNAME attribute. Both must be present for integrity checks."
            }
            Self::UseTls => {
                "(Use TLS): The Shared Secret request has to be sent over TLS, but was not received \
                 over TLS."
            }
            Self::ServerError => {
                "(Server Error): The server has suffered a temporary error. The client should try again."
            }
            Self::GlobalFailure => {
                "(Global Failure): The server is refusing to fulfill the request. The client should \
                 not retry."
            }
            Self::ClientFailure => "(Client Failure): The response could not be used.",
            Self::BadRequest => {
                "(Bad Request): The request was malformed. The client should not retry the request \
                 without modification from the previous attempt."
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}
