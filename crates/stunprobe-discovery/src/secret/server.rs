//! TLS shared-secret server.
//!
//! Connections are handled one at a time on the accept task. Each accept
//! wait is bounded by `accept_poll`; a wait that expires sweeps stale
//! credentials from the registry.

use super::CredentialRegistry;
use super::exchange::{read_message, write_message};
use crate::error::ServiceError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use stunprobe_core::{Attribute, ErrorCode, MessageClass, MessageHeader};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Shared-secret server configuration
#[derive(Debug, Clone)]
pub struct SharedSecretServerConfig {
    /// Maximum wait per accept before sweeping the registry
    pub accept_poll: Duration,
    /// Credential lifetime
    pub credential_ttl: Duration,
    /// Limit for the handshake and for reading one request
    pub io_timeout: Duration,
}

impl Default for SharedSecretServerConfig {
    fn default() -> Self {
        Self {
            accept_poll: Duration::from_secs(30),
            credential_ttl: super::CREDENTIAL_TTL,
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// Running shared-secret server
pub struct SharedSecretServer {
    local_addr: SocketAddr,
    registry: Arc<CredentialRegistry>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SharedSecretServer {
    /// Bind and start serving with default configuration
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn start(bind_addr: SocketAddr, acceptor: TlsAcceptor) -> Result<Self, ServiceError> {
        Self::start_with_config(bind_addr, acceptor, SharedSecretServerConfig::default()).await
    }

    /// Bind and start serving
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn start_with_config(
        bind_addr: SocketAddr,
        acceptor: TlsAcceptor,
        config: SharedSecretServerConfig,
    ) -> Result<Self, ServiceError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(CredentialRegistry::new(config.credential_ttl));
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        tracing::info!(
            %local_addr,
            ttl_secs = config.credential_ttl.as_secs(),
            "Shared secret server listening"
        );

        let task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::clone(&registry),
            Arc::clone(&running),
            Arc::clone(&shutdown),
            config,
        ));

        Ok(Self {
            local_addr,
            registry,
            running,
            shutdown,
            task,
        })
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry of issued credentials, for co-located responders
    #[must_use]
    pub fn registry(&self) -> Arc<CredentialRegistry> {
        Arc::clone(&self.registry)
    }

    /// True while the accept loop is alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Ask the accept loop to exit
    ///
    /// A connection already being handled is allowed to finish.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

impl Drop for SharedSecretServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<CredentialRegistry>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    config: SharedSecretServerConfig,
) {
    while running.load(Ordering::SeqCst) {
        let accepted = tokio::select! {
            () = shutdown.notified() => break,
            accepted = tokio::time::timeout(config.accept_poll, listener.accept()) => accepted,
        };

        match accepted {
            Err(_) => {
                let evicted = registry.sweep(SystemTime::now());
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = registry.len(), "Swept stale credentials");
                }
            }
            Ok(Ok((tcp, peer))) => {
                if let Err(e) =
                    handle_connection(tcp, &acceptor, &registry, config.io_timeout).await
                {
                    tracing::warn!(%peer, error = %e, "Shared secret exchange failed");
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Accept failed");
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    tracing::info!("Shared secret server stopped");
}

async fn handle_connection(
    tcp: TcpStream,
    acceptor: &TlsAcceptor,
    registry: &CredentialRegistry,
    io_timeout: Duration,
) -> Result<(), ServiceError> {
    let mut stream = tokio::time::timeout(io_timeout, acceptor.accept(tcp))
        .await
        .map_err(|_| ServiceError::Timeout)??;

    let request = tokio::time::timeout(io_timeout, read_message(&mut stream))
        .await
        .map_err(|_| ServiceError::Timeout)??;

    let reply = respond(registry, &request);
    write_message(&mut stream, &reply).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Build the reply to one shared-secret request
///
/// Every accepted request mints a credential, including verify requests.
/// A verify request is checked before its own credential is minted.
fn respond(registry: &CredentialRegistry, request: &MessageHeader) -> MessageHeader {
    let reply_to = |class| {
        let mut reply = MessageHeader::new(class);
        reply.set_transaction_id(request.transaction_id());
        reply
    };

    let class = request.class();
    if !matches!(
        class,
        MessageClass::SharedSecretRequest | MessageClass::SharedSecretVerifyRequest
    ) {
        tracing::debug!(?class, "Rejecting non shared-secret request");
        let mut reply = reply_to(MessageClass::SharedSecretErrorResponse);
        reply.add_attribute(Attribute::error_code(ErrorCode::BadRequest));
        return reply;
    }

    if class == MessageClass::SharedSecretVerifyRequest {
        let verdict = registry.check_integrity(request);
        registry.issue();
        return match verdict {
            Ok(password) => {
                let mut reply = reply_to(MessageClass::SharedSecretResponse);
                reply.add_attribute(Attribute::password(&password));
                reply
            }
            Err(code) => {
                tracing::debug!(code = code.code(), "Remote verification rejected");
                let mut reply = reply_to(MessageClass::SharedSecretErrorResponse);
                reply.add_attribute(Attribute::error_code(code));
                reply
            }
        };
    }

    let credential = registry.issue();
    tracing::debug!(username = credential.username(), "Issued shared secret");
    let mut reply = reply_to(MessageClass::SharedSecretResponse);
    reply.add_attribute(Attribute::username(credential.username()));
    reply.add_attribute(Attribute::password(credential.password()));
    reply
}
