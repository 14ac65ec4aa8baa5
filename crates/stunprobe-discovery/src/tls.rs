//! TLS channel setup for the shared-secret exchange.
//!
//! Clients get a [`TlsChannelFactory`] that hands out handshake-complete
//! streams; servers get a `TlsAcceptor` built from PEM files. Key material
//! is loaded here and nowhere else.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Default time allowed for connect plus handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS configuration and handshake errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// File or socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// rustls rejected the configuration or the handshake
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// PEM file held no certificates
    #[error("no certificates found in {0}")]
    NoCertificates(String),

    /// PEM file held no private key
    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    /// Server name is not a valid DNS name or IP address
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// Connect or handshake took too long
    #[error("TLS handshake timed out")]
    Timeout,
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Produces handshake-complete TLS streams
#[derive(Clone)]
pub struct TlsChannelFactory {
    connector: TlsConnector,
    timeout: Duration,
}

impl std::fmt::Debug for TlsChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsChannelFactory")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TlsChannelFactory {
    /// Wrap a ready client configuration
    #[must_use]
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Trust exactly the roots in `roots`
    ///
    /// # Errors
    ///
    /// Returns an error if the default protocol versions cannot be set up.
    pub fn from_root_store(roots: RootCertStore) -> Result<Self, TlsError> {
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::new(Arc::new(config)))
    }

    /// Trust the given DER certificates
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate is rejected or the list is empty.
    pub fn from_root_der<I>(certs: I) -> Result<Self, TlsError>
    where
        I: IntoIterator<Item = CertificateDer<'static>>,
    {
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert)?;
        }
        if roots.is_empty() {
            return Err(TlsError::NoCertificates("root list".to_string()));
        }
        Self::from_root_store(roots)
    }

    /// Trust the certificates in a PEM file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no certificates.
    pub fn from_root_pem(path: &Path) -> Result<Self, TlsError> {
        Self::from_root_der(load_certs(path)?)
    }

    /// Override the connect + handshake timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect to `addr` and complete a handshake, validating `server_name`
    ///
    /// # Errors
    ///
    /// Returns an error on connect failure, handshake failure, an invalid
    /// server name, or timeout.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        let handshake = async {
            let tcp = TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            self.connector.connect(name, tcp).await
        };

        let stream = tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| TlsError::Timeout)??;

        tracing::debug!(%addr, server_name, "TLS channel established");
        Ok(stream)
    }
}

/// Build a server acceptor from a certificate chain and key in PEM files
///
/// # Errors
///
/// Returns an error if either file cannot be read, holds nothing usable, or
/// the key does not match the certificate.
pub fn server_acceptor(cert_pem: &Path, key_pem: &Path) -> Result<TlsAcceptor, TlsError> {
    let chain = load_certs(cert_pem)?;
    let key = load_private_key(key_pem)?;
    acceptor_from_der(chain, key)
}

/// Build a server acceptor from DER material
///
/// # Errors
///
/// Returns an error if rustls rejects the certificate/key pair.
pub fn acceptor_from_der(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor, TlsError> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}
