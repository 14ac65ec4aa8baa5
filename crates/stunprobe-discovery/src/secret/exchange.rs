//! Stream framing and the client side of the shared-secret exchange.

use super::{CredentialRegistry, SecretError, SharedSecret};
use crate::error::ServiceError;
use crate::tls::TlsChannelFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use stunprobe_core::{AttributeType, ErrorCode, HEADER_SIZE, MessageClass, MessageHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

const INCOMPLETE_SECRET_RESPONSE: &str = "The server is sending an incomplete response (Username and \
     Password message attributes are missing). The client should not retry.";

/// Read exactly one message: the fixed header, then the declared body
///
/// # Errors
///
/// Returns [`ServiceError::UnexpectedEof`] if the peer closes early, or a
/// codec error if the message does not decode.
pub async fn read_message<S>(stream: &mut S) -> Result<MessageHeader, ServiceError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; HEADER_SIZE];
    read_full(stream, &mut buf).await?;

    let body_len = MessageHeader::peek_body_len(&buf)?;
    buf.resize(HEADER_SIZE + body_len, 0);
    read_full(stream, &mut buf[HEADER_SIZE..]).await?;

    Ok(MessageHeader::decode(&buf)?)
}

async fn read_full<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), ServiceError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ServiceError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}

/// Encode `message`, write it and flush
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub async fn write_message<S>(stream: &mut S, message: &MessageHeader) -> Result<(), ServiceError>
where
    S: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// One request/reply round trip over a fresh TLS channel
async fn round_trip(
    channel: &TlsChannelFactory,
    addr: SocketAddr,
    server_name: &str,
    request: &MessageHeader,
) -> Result<MessageHeader, ServiceError> {
    let mut stream = channel.connect(addr, server_name).await?;
    write_message(&mut stream, request).await?;
    let reply = read_message(&mut stream).await?;
    let _ = stream.shutdown().await;
    Ok(reply)
}

/// Ask a shared-secret server for a fresh credential
///
/// Single attempt, never retried.
///
/// # Errors
///
/// An ERROR-CODE in the reply is returned as-is. Transport failures and
/// replies missing USERNAME or PASSWORD come back as code 700.
pub async fn request_shared_secret(
    channel: &TlsChannelFactory,
    addr: SocketAddr,
    server_name: &str,
) -> Result<SharedSecret, SecretError> {
    let request = MessageHeader::with_generated_id(MessageClass::SharedSecretRequest);

    let reply = round_trip(channel, addr, server_name, &request)
        .await
        .map_err(|e| {
            tracing::warn!(%addr, error = %e, "Shared secret request failed");
            SecretError::client(e.to_string())
        })?;

    if let Some(err) = reply.error() {
        return Err(SecretError {
            code: err.code,
            message: err.reason,
        });
    }

    let username = reply
        .attribute(AttributeType::Username)
        .and_then(|a| a.username_str());
    let password = reply
        .attribute(AttributeType::Password)
        .and_then(|a| a.password_bytes());

    match (username, password) {
        (Some(username), Some(password)) => {
            tracing::debug!(%addr, username, "Obtained shared secret");
            Ok(SharedSecret::new(username, password))
        }
        _ => Err(SecretError::client(INCOMPLETE_SECRET_RESPONSE)),
    }
}

/// Ask a remote shared-secret server to vouch for a signed request
///
/// The request is resent with class SharedSecretVerifyRequest; the server
/// checks the integrity against its own registry.
///
/// # Errors
///
/// Returns the ERROR-CODE from the reply, 600 if the reply carries neither
/// an error nor a password, and 500 if the exchange itself fails.
pub async fn verify_remote(
    channel: &TlsChannelFactory,
    addr: SocketAddr,
    server_name: &str,
    request: &MessageHeader,
) -> Result<Zeroizing<Vec<u8>>, ErrorCode> {
    let mut verify = request.clone();
    verify.set_class(MessageClass::SharedSecretVerifyRequest);

    let reply = round_trip(channel, addr, server_name, &verify)
        .await
        .map_err(|e| {
            tracing::warn!(%addr, error = %e, "Remote integrity verification failed");
            ErrorCode::ServerError
        })?;

    if let Some(err) = reply.error() {
        return Err(ErrorCode::from_code(err.code).unwrap_or(ErrorCode::GlobalFailure));
    }

    reply
        .attribute(AttributeType::Password)
        .and_then(|a| a.password_bytes())
        .map(|p| Zeroizing::new(p.to_vec()))
        .ok_or(ErrorCode::GlobalFailure)
}

/// How a binding responder checks MESSAGE-INTEGRITY on requests
#[derive(Debug, Clone, Default)]
pub enum IntegrityVerifier {
    /// No enforcement, responses are unsigned
    #[default]
    None,
    /// Check against an in-process registry
    Local(Arc<CredentialRegistry>),
    /// Ask a remote shared-secret server over TLS
    Remote {
        /// Shared-secret server address
        addr: SocketAddr,
        /// Name the server's certificate must carry
        server_name: String,
        /// TLS connector
        channel: TlsChannelFactory,
    },
}

impl IntegrityVerifier {
    /// True unless this is [`IntegrityVerifier::None`]
    #[must_use]
    pub fn is_enforcing(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Check `request` and return the password to sign the reply with
    ///
    /// `Ok(None)` means enforcement is off.
    ///
    /// # Errors
    ///
    /// Returns the protocol error code to put in the error response.
    pub async fn verify(
        &self,
        request: &MessageHeader,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, ErrorCode> {
        match self {
            Self::None => Ok(None),
            Self::Local(registry) => registry.check_integrity(request).map(Some),
            Self::Remote {
                addr,
                server_name,
                channel,
            } => verify_remote(channel, *addr, server_name, request)
                .await
                .map(Some),
        }
    }
}
