//! Shared-secret exchange over TLS.
//!
//! A client asks the server for a short-lived username/password pair; the
//! server mints one, remembers it for ten minutes, and can later vouch for
//! it when a binding responder forwards a signed request for verification.

mod credentials;
mod exchange;
mod server;

pub use credentials::{CREDENTIAL_TTL, Credential, CredentialRegistry};
pub use exchange::{IntegrityVerifier, read_message, request_shared_secret, verify_remote, write_message};
pub use server::{SharedSecretServer, SharedSecretServerConfig};

use thiserror::Error;
use zeroize::Zeroizing;

/// Username/password pair obtained from a shared-secret server
#[derive(Clone)]
pub struct SharedSecret {
    username: String,
    password: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl SharedSecret {
    /// Create from parts
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Username
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password bytes
    #[must_use]
    pub fn password(&self) -> &[u8] {
        &self.password
    }
}

impl From<&Credential> for SharedSecret {
    fn from(credential: &Credential) -> Self {
        Self::new(credential.username(), credential.password())
    }
}

/// Failed shared-secret request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("shared secret request failed: {code} {message}")]
pub struct SecretError {
    /// ERROR-CODE returned by the server, or 700 for local failures
    pub code: u16,
    /// Reason phrase or local failure description
    pub message: String,
}

impl SecretError {
    pub(crate) fn client(message: impl Into<String>) -> Self {
        Self {
            code: stunprobe_core::ErrorCode::ClientFailure.code(),
            message: message.into(),
        }
    }
}
