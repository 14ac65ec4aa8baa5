//! # stunprobe Discovery
//!
//! Network side of classic STUN (RFC 3489) NAT discovery.
//!
//! This crate provides:
//! - NAT classification client (Test I, II, III state machine)
//! - UDP binding responder with change-address hand-off to a peer
//! - Shared-secret service over TLS with a short-lived credential registry
//! - DNS SRV/A discovery of STUN servers
//!
//! ## Example
//!
//! ```rust,no_run
//! use stunprobe_discovery::{BindingResponder, ResponderConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResponderConfig {
//!     alternate: Some("198.51.100.2:3479".parse()?),
//!     ..ResponderConfig::default()
//! };
//! let responder = BindingResponder::start_with_config("0.0.0.0:3478".parse()?, config).await?;
//! assert!(responder.is_running());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dns;
pub mod error;
pub mod nat;
pub mod responder;
pub mod secret;
pub mod tls;

pub use dns::{DnsConfig, DnsError, DnsResolver, StunServerAddress, discover_servers};
pub use error::ServiceError;
pub use nat::{
    BindingTest, DiscoveryInfo, ProbeConfig, ProbeError, ProbeState, Scenario, Step, StunClient,
};
pub use responder::{BindingResponder, ResponderConfig};
pub use secret::{
    CredentialRegistry, IntegrityVerifier, SecretError, SharedSecret, SharedSecretServer,
    SharedSecretServerConfig,
};
pub use tls::{TlsChannelFactory, TlsError};

use std::net::{SocketAddr, SocketAddrV4};

/// IPv4 view of an endpoint, unwrapping IPv4-mapped IPv6
///
/// Address attributes only carry IPv4.
pub(crate) fn ipv4_endpoint(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}
