//! Errors shared by the network services.

use crate::tls::TlsError;
use stunprobe_core::CodecError;
use thiserror::Error;

/// Service and stream-exchange errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Peer did not answer in time
    #[error("operation timed out")]
    Timeout,

    /// Peer closed the stream before a full message arrived
    #[error("connection closed mid-message")]
    UnexpectedEof,
}
