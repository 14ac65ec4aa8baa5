//! NAT classification client.
//!
//! Probes run strictly one after another, each from a fresh UDP socket.
//! The classifier state (mapped and changed address from the first test)
//! is threaded through the steps in a [`ProbeState`], so any step can run
//! on its own against a constructed prior state.
//!
//! A timeout is a verdict here, not a failure: which probe goes
//! unanswered is what tells the scenarios apart.

use super::types::{BindingTest, DiscoveryInfo, Scenario};
use crate::dns::{self, StunServerAddress};
use crate::ipv4_endpoint;
use crate::secret::{self, SecretError, SharedSecret};
use crate::tls::TlsChannelFactory;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use stunprobe_core::{
    Attribute, AttributeType, CodecError, DEFAULT_PORT, ErrorCode, MAX_MESSAGE_SIZE, MessageClass,
    MessageHeader, TransactionId,
};
use thiserror::Error;
use tokio::net::UdpSocket;

const INCOMPLETE_RESPONSE: &str = "The server is sending an incomplete response (Mapped Address \
     and Changed Address message attributes are missing). The client should not retry.";

const MISSING_CHANGED_ADDRESS: &str = "The server has sent an incomplete response in an earlier \
     call to Test1 (Changed Address message attributes was missing). The client should not retry.";

const WRONG_HMAC: &str = "Wrong HMAC received from server, this might be an attack response";

/// Probe transport errors
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No answer within the retransmit budget
    #[error("no response within the retransmit budget")]
    Timeout,

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Request could not be encoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Server host did not resolve to an IPv4 address
    #[error("cannot resolve {0}")]
    Resolve(String),
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// First retransmit timeout
    pub initial_rto: Duration,
    /// Retransmit timeout cap
    pub max_rto: Duration,
    /// Give up once the accumulated timeouts exceed this
    pub budget: Duration,
    /// Local address each probe socket binds to
    pub local_bind: SocketAddr,
    /// Sign probes with the shared secret when one is supplied
    pub sign_requests: bool,
    /// Port of the shared-secret service on the server host
    pub tls_port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(100),
            max_rto: Duration::from_millis(1600),
            budget: Duration::from_millis(9500),
            local_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            sign_requests: false,
            tls_port: DEFAULT_PORT,
        }
    }
}

/// Classifier state carried from one step to the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeState {
    info: DiscoveryInfo,
    server: SocketAddr,
    mapped_address: Option<SocketAddr>,
    changed_address: Option<SocketAddr>,
}

impl ProbeState {
    /// Fresh state before Test I
    #[must_use]
    pub fn new(server: SocketAddr) -> Self {
        Self {
            info: DiscoveryInfo::default(),
            server,
            mapped_address: None,
            changed_address: None,
        }
    }

    /// State as a successful Test I would leave it
    #[must_use]
    pub fn after_test1a(
        server: SocketAddr,
        mapped: SocketAddr,
        changed: Option<SocketAddr>,
        natted: bool,
    ) -> Self {
        let mut state = Self::new(server);
        state.info.set_last_test(BindingTest::Test1FirstRun);
        state.info.set_public_address(mapped);
        state.info.set_natted(natted);
        state.mapped_address = Some(mapped);
        state.changed_address = changed;
        state
    }

    /// Results so far
    #[must_use]
    pub fn info(&self) -> &DiscoveryInfo {
        &self.info
    }

    /// Primary server endpoint
    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// MAPPED-ADDRESS from Test I
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.mapped_address
    }

    /// CHANGED-ADDRESS from Test I
    #[must_use]
    pub fn changed_address(&self) -> Option<SocketAddr> {
        self.changed_address
    }

    /// Give up the state, keeping the results
    #[must_use]
    pub fn into_info(self) -> DiscoveryInfo {
        self.info
    }

    fn finish(mut self, scenario: Scenario) -> Step {
        self.info.set_scenario(scenario);
        Step::Finished(self)
    }

    fn fail(mut self, code: u16, message: impl Into<String>) -> Step {
        self.info.set_error(code, message);
        Step::Finished(self)
    }
}

/// Outcome of one classifier step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run the next test
    Continue(ProbeState),
    /// Classification is over
    Finished(ProbeState),
}

impl Step {
    /// State after the step
    #[must_use]
    pub fn state(&self) -> &ProbeState {
        match self {
            Self::Continue(state) | Self::Finished(state) => state,
        }
    }

    /// True if the chain should go on
    #[must_use]
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue(_))
    }

    /// Results after the step
    #[must_use]
    pub fn into_info(self) -> DiscoveryInfo {
        match self {
            Self::Continue(state) | Self::Finished(state) => state.into_info(),
        }
    }
}

/// Client for binding discovery against one server
#[derive(Debug, Clone)]
pub struct StunClient {
    server: String,
    port: u16,
    config: ProbeConfig,
}

impl StunClient {
    /// Client for `server:port` with default configuration
    #[must_use]
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self::with_config(server, port, ProbeConfig::default())
    }

    /// Client for `server:port`
    #[must_use]
    pub fn with_config(server: impl Into<String>, port: u16, config: ProbeConfig) -> Self {
        Self {
            server: server.into(),
            port,
            config,
        }
    }

    /// Server host
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Server port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Run the full classification chain
    pub async fn bind(&self, secret: Option<&SharedSecret>) -> DiscoveryInfo {
        let server = match resolve(&self.server, self.port).await {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "Cannot resolve STUN server");
                return DiscoveryInfo::default();
            }
        };

        let state = match self.test1a(ProbeState::new(server), secret).await {
            Step::Continue(state) => state,
            finished @ Step::Finished(_) => return finished.into_info(),
        };
        let state = match self.test2(state, secret).await {
            Step::Continue(state) => state,
            finished @ Step::Finished(_) => return finished.into_info(),
        };
        let state = match self.test1b(state, secret).await {
            Step::Continue(state) => state,
            finished @ Step::Finished(_) => return finished.into_info(),
        };
        self.test3(state, secret).await.into_info()
    }

    /// Run Test I only, to learn the public endpoint
    pub async fn bind_remote_address_only(&self, secret: Option<&SharedSecret>) -> DiscoveryInfo {
        match resolve(&self.server, self.port).await {
            Ok(server) => self.test1a(ProbeState::new(server), secret).await.into_info(),
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "Cannot resolve STUN server");
                DiscoveryInfo::default()
            }
        }
    }

    /// Test I against the primary server
    pub async fn test1a(&self, mut state: ProbeState, secret: Option<&SharedSecret>) -> Step {
        state.info.set_last_test(BindingTest::Test1FirstRun);

        let (response, local) = match self.probe(state.server, secret).await {
            Ok(exchange) => exchange,
            Err(ProbeError::Timeout) => {
                tracing::debug!(server = %state.server, "No answer to test 1, UDP is blocked");
                return state.finish(Scenario::UdpBlocked);
            }
            Err(e) => {
                tracing::warn!(server = %state.server, error = %e, "Test 1 failed");
                return Step::Finished(state);
            }
        };

        if let Some(err) = response.error() {
            return state.fail(err.code, err.reason);
        }
        let Some(mapped) = response.address(AttributeType::MappedAddress) else {
            return state.fail(ErrorCode::ClientFailure.code(), INCOMPLETE_RESPONSE);
        };
        if !integrity_ok(&response, secret) {
            return state.fail(ErrorCode::ClientFailure.code(), WRONG_HMAC);
        }

        let natted = mapped != local;
        state.mapped_address = Some(mapped);
        state.changed_address = response.address(AttributeType::ChangedAddress);
        state.info.set_public_address(mapped);
        state.info.add_local_address(local.ip());
        state.info.set_natted(natted);

        tracing::debug!(%mapped, %local, natted, "Test 1 answered");
        Step::Continue(state)
    }

    /// Test II against the primary server
    ///
    /// Always ends the chain.
    pub async fn test2(&self, mut state: ProbeState, secret: Option<&SharedSecret>) -> Step {
        state.info.set_last_test(BindingTest::Test2);
        let natted = state.info.is_natted();

        let response = match self.probe(state.server, secret).await {
            Ok((response, _)) => response,
            Err(ProbeError::Timeout) => {
                let scenario = if natted {
                    Scenario::SymmetricFirewall
                } else {
                    Scenario::OpenInternet
                };
                tracing::debug!(natted, %scenario, "No answer to test 2");
                return state.finish(scenario);
            }
            Err(e) => {
                tracing::warn!(server = %state.server, error = %e, "Test 2 failed");
                return Step::Finished(state);
            }
        };

        if let Some(err) = response.error() {
            return state.fail(err.code, err.reason);
        }
        if !integrity_ok(&response, secret) {
            return state.fail(ErrorCode::ClientFailure.code(), WRONG_HMAC);
        }

        let scenario = if natted {
            Scenario::FullConeNat
        } else {
            Scenario::OpenInternet
        };
        tracing::debug!(natted, %scenario, "Test 2 answered");
        state.finish(scenario)
    }

    /// Test I against the changed address
    pub async fn test1b(&self, mut state: ProbeState, secret: Option<&SharedSecret>) -> Step {
        let Some(changed) = state.changed_address else {
            return state.fail(ErrorCode::ClientFailure.code(), MISSING_CHANGED_ADDRESS);
        };
        state.info.set_last_test(BindingTest::Test1SecondRun);

        let response = match self.probe(changed, secret).await {
            Ok((response, _)) => response,
            Err(e) => {
                tracing::debug!(%changed, error = %e, "Test 1 second run got no answer");
                return Step::Finished(state);
            }
        };

        let Some(mapped) = response.address(AttributeType::MappedAddress) else {
            return state.fail(ErrorCode::ClientFailure.code(), INCOMPLETE_RESPONSE);
        };
        if let Some(err) = response.error() {
            return state.fail(err.code, err.reason);
        }
        if !integrity_ok(&response, secret) {
            return state.fail(ErrorCode::ClientFailure.code(), WRONG_HMAC);
        }

        let first_ip = state.mapped_address.map(|a| a.ip());
        if first_ip != Some(mapped.ip()) {
            tracing::debug!(?first_ip, second = %mapped, "Mapping changed with destination");
            return state.finish(Scenario::SymmetricNat);
        }
        Step::Continue(state)
    }

    /// Test III against the primary server
    pub async fn test3(&self, mut state: ProbeState, secret: Option<&SharedSecret>) -> Step {
        state.info.set_last_test(BindingTest::Test3);
        let natted = state.info.is_natted();

        let response = match self.probe(state.server, secret).await {
            Ok((response, _)) => response,
            Err(ProbeError::Timeout) => {
                if natted {
                    return state.finish(Scenario::RestrictedPortNat);
                }
                return Step::Finished(state);
            }
            Err(e) => {
                tracing::warn!(server = %state.server, error = %e, "Test 3 failed");
                return Step::Finished(state);
            }
        };

        if let Some(err) = response.error() {
            return state.fail(err.code, err.reason);
        }
        if !integrity_ok(&response, secret) {
            return state.fail(ErrorCode::ClientFailure.code(), WRONG_HMAC);
        }

        if natted {
            return state.finish(Scenario::RestrictedConeNat);
        }
        Step::Finished(state)
    }

    /// Ask the server host's shared-secret service for a credential
    ///
    /// # Errors
    ///
    /// See [`secret::request_shared_secret`]; resolution failures are
    /// reported as code 700 too.
    pub async fn request_shared_secret(
        &self,
        channel: &TlsChannelFactory,
    ) -> Result<SharedSecret, SecretError> {
        let addr = resolve(&self.server, self.config.tls_port)
            .await
            .map_err(|e| SecretError::client(e.to_string()))?;
        secret::request_shared_secret(channel, addr, &self.server).await
    }

    /// Look up STUN servers for `domain` through `dns_server`
    pub async fn discover_servers(domain: &str, dns_server: IpAddr) -> Vec<StunServerAddress> {
        dns::discover_servers(domain, dns_server).await
    }

    /// One request/response exchange from a fresh socket
    ///
    /// Returns the response and the local endpoint it was sent from.
    async fn probe(
        &self,
        destination: SocketAddr,
        secret: Option<&SharedSecret>,
    ) -> Result<(MessageHeader, SocketAddr), ProbeError> {
        let socket = probe_socket(self.config.local_bind)?;
        let local = local_endpoint(&socket, destination).await?;
        let request = self.probe_request(secret);
        let response = self.transact(&socket, destination, &request).await?;
        Ok((response, local))
    }

    fn probe_request(&self, secret: Option<&SharedSecret>) -> MessageHeader {
        let mut request = MessageHeader::with_generated_id(MessageClass::BindingRequest);
        if let (true, Some(secret)) = (self.config.sign_requests, secret) {
            request.add_attribute(Attribute::username(secret.username()));
            if let Err(e) = request.add_message_integrity(secret.password()) {
                tracing::warn!(error = %e, "Could not sign probe");
            }
        }
        request
    }

    /// Send with escalating retransmit timeouts until a matching response
    /// arrives or the budget runs out
    async fn transact(
        &self,
        socket: &UdpSocket,
        destination: SocketAddr,
        request: &MessageHeader,
    ) -> Result<MessageHeader, ProbeError> {
        let bytes = request.encode()?;
        let id = request.transaction_id();
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut rto = self.config.initial_rto;
        let mut waited = Duration::ZERO;

        loop {
            socket.send_to(&bytes, destination).await?;

            match tokio::time::timeout(rto, receive_matching(socket, &mut buf, id)).await {
                Ok(result) => return result,
                Err(_) => {
                    if rto < self.config.max_rto {
                        rto = (rto * 2).min(self.config.max_rto);
                    }
                    waited += rto;
                    if waited > self.config.budget {
                        return Err(ProbeError::Timeout);
                    }
                    tracing::trace!(%destination, rto_ms = rto.as_millis() as u64, "Retransmitting");
                }
            }
        }
    }
}

/// Wait for a response carrying `id`, skipping anything else
async fn receive_matching(
    socket: &UdpSocket,
    buf: &mut [u8],
    id: TransactionId,
) -> Result<MessageHeader, ProbeError> {
    loop {
        let (len, from) = socket.recv_from(buf).await?;
        match MessageHeader::decode(&buf[..len]) {
            Ok(response) if response.transaction_id() == id => return Ok(response),
            Ok(_) => tracing::trace!(%from, "Ignoring response for another transaction"),
            Err(e) => tracing::debug!(%from, error = %e, "Ignoring malformed datagram"),
        }
    }
}

/// Fresh UDP socket with address reuse, so probes can share a fixed port
fn probe_socket(bind: SocketAddr) -> Result<UdpSocket, ProbeError> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket)?)
}

/// Local endpoint of `socket` as seen when talking to `destination`
///
/// A wildcard bind is resolved through the routing table by connecting a
/// throwaway socket; nothing is sent.
async fn local_endpoint(socket: &UdpSocket, destination: SocketAddr) -> Result<SocketAddr, ProbeError> {
    let local = socket.local_addr()?;
    if !local.ip().is_unspecified() {
        return Ok(local);
    }
    let route = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
    route.connect(destination).await?;
    Ok(SocketAddr::new(route.local_addr()?.ip(), local.port()))
}

/// A present MESSAGE-INTEGRITY must match the shared secret
fn integrity_ok(response: &MessageHeader, secret: Option<&SharedSecret>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    if !response.has_attribute(AttributeType::MessageIntegrity) {
        return true;
    }
    response.verify_message_integrity(secret.password()).is_ok()
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Resolve(format!("{host}: {e}")))?;
    addrs
        .find_map(|addr| ipv4_endpoint(addr).map(SocketAddr::V4))
        .ok_or_else(|| ProbeError::Resolve(host.to_string()))
}
