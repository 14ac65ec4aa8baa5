//! UDP binding responder.
//!
//! Answers binding requests with the observed source endpoint, the
//! alternate endpoint and the endpoint the reply is sent from. Requests
//! for a changed address are handed to a peer responder running on the
//! alternate endpoint, which relays the response to the client.

use crate::error::ServiceError;
use crate::ipv4_endpoint;
use crate::secret::IntegrityVerifier;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stunprobe_core::{
    Attribute, AttributeType, ErrorCode, MAX_MESSAGE_SIZE, MessageClass, MessageHeader,
};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Binding responder configuration
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Public IP advertised in CHANGED-ADDRESS and SOURCE-ADDRESS
    ///
    /// Defaults to the bound IP when unset.
    pub public_address: Option<IpAddr>,
    /// Peer responder used for change-address replies
    pub alternate: Option<SocketAddr>,
    /// Receive wait between shutdown checks
    pub poll_interval: Duration,
    /// MESSAGE-INTEGRITY enforcement
    pub verifier: IntegrityVerifier,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            public_address: None,
            alternate: None,
            poll_interval: Duration::from_secs(1),
            verifier: IntegrityVerifier::None,
        }
    }
}

/// Where a response leaves from and goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Hand to the alternate peer for relaying
    Alternate(SocketAddr),
    /// Send from a fresh ephemeral socket
    Ephemeral(SocketAddr),
    /// Send from the receiving socket
    Reply(SocketAddr),
}

impl Delivery {
    fn destination(self) -> SocketAddr {
        match self {
            Self::Alternate(addr) | Self::Ephemeral(addr) | Self::Reply(addr) => addr,
        }
    }
}

/// Per-responder state shared by the receive loop
struct Handler {
    socket: UdpSocket,
    local_addr: SocketAddr,
    public_ip: IpAddr,
    alternate: Option<SocketAddr>,
    verifier: IntegrityVerifier,
}

/// Running binding responder
pub struct BindingResponder {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl BindingResponder {
    /// Bind and start answering with default configuration
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound.
    pub async fn start(bind_addr: SocketAddr) -> Result<Self, ServiceError> {
        Self::start_with_config(bind_addr, ResponderConfig::default()).await
    }

    /// Bind and start answering
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound.
    pub async fn start_with_config(
        bind_addr: SocketAddr,
        config: ResponderConfig,
    ) -> Result<Self, ServiceError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let handler = Handler {
            socket,
            local_addr,
            public_ip: config.public_address.unwrap_or(local_addr.ip()),
            alternate: config.alternate,
            verifier: config.verifier,
        };

        tracing::info!(
            %local_addr,
            public_ip = %handler.public_ip,
            alternate = ?handler.alternate,
            integrity = handler.verifier.is_enforcing(),
            "Binding responder listening"
        );

        let task = tokio::spawn(receive_loop(
            handler,
            Arc::clone(&running),
            Arc::clone(&shutdown),
            config.poll_interval,
        ));

        Ok(Self {
            local_addr,
            running,
            shutdown,
            task,
        })
    }

    /// Address the socket is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True while the receive loop is alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Ask the receive loop to exit; the socket closes when it does
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

impl Drop for BindingResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn receive_loop(
    handler: Handler,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    poll_interval: Duration,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    while running.load(Ordering::SeqCst) {
        let received = tokio::select! {
            () = shutdown.notified() => break,
            received = tokio::time::timeout(poll_interval, handler.socket.recv_from(&mut buf)) => received,
        };

        let (len, source) = match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Receive failed");
                continue;
            }
            Ok(Ok(received)) => received,
        };

        match MessageHeader::decode(&buf[..len]) {
            Ok(message) => handler.handle(message, source).await,
            Err(e) => tracing::warn!(%source, error = %e, "Dropping malformed datagram"),
        }
    }

    running.store(false, Ordering::SeqCst);
    tracing::info!(local_addr = %handler.local_addr, "Binding responder stopped");
}

impl Handler {
    /// Integrity failures are answered to the packet source, never to a
    /// RESPONSE-ADDRESS the unauthenticated request names.
    async fn handle(&self, message: MessageHeader, source: SocketAddr) {
        if message.class() == MessageClass::BindingResponse {
            self.relay(message, source).await;
            return;
        }

        let mut response = self.build_response(&message, source);
        let delivery = self.plan_delivery(&mut response, &message, source);

        match self.verifier.verify(&message).await {
            Ok(None) => {}
            Ok(Some(password)) => {
                if let Err(e) = response.add_message_integrity(&password) {
                    tracing::warn!(%source, error = %e, "Could not sign response");
                    let reply = error_response(&message, ErrorCode::ServerError);
                    self.send(&reply, Delivery::Reply(source)).await;
                    return;
                }
            }
            Err(code) => {
                tracing::debug!(%source, code = code.code(), "Integrity check failed");
                let reply = error_response(&message, code);
                self.send(&reply, Delivery::Reply(source)).await;
                return;
            }
        }

        self.send(&response, delivery).await;
    }

    /// Success response for a request from `source`, without integrity
    fn build_response(&self, request: &MessageHeader, source: SocketAddr) -> MessageHeader {
        let mut response = MessageHeader::new(MessageClass::BindingResponse);
        response.set_transaction_id(request.transaction_id());

        if let Some(mapped) = ipv4_endpoint(source) {
            response.add_attribute(Attribute::address(AttributeType::MappedAddress, mapped));
            if request.has_attribute(AttributeType::ResponseAddress) {
                response.add_attribute(Attribute::address(AttributeType::ReflectedFrom, mapped));
            }
        }

        let changed = self
            .alternate
            .unwrap_or(SocketAddr::new(self.public_ip, self.local_addr.port()));
        if let Some(changed) = ipv4_endpoint(changed) {
            response.add_attribute(Attribute::address(AttributeType::ChangedAddress, changed));
        }

        let flags = request
            .attribute(AttributeType::ChangeRequest)
            .and_then(Attribute::change_flags)
            .unwrap_or_default();

        let source_ip = match (flags.change_address, self.alternate) {
            (true, Some(alternate)) => alternate.ip(),
            _ => self.public_ip,
        };
        let source_port = match (flags.change_port, self.alternate) {
            (true, Some(alternate)) => alternate.port(),
            _ => self.local_addr.port(),
        };
        if let Some(origin) = ipv4_endpoint(SocketAddr::new(source_ip, source_port)) {
            response.add_attribute(Attribute::address(AttributeType::SourceAddress, origin));
        }

        response.set_change_address(flags.change_address);
        response.set_change_port(flags.change_port);
        response
    }

    /// Pick the delivery path; a hand-off to the alternate peer carries the
    /// client's RESPONSE-ADDRESS along
    fn plan_delivery(
        &self,
        response: &mut MessageHeader,
        request: &MessageHeader,
        source: SocketAddr,
    ) -> Delivery {
        let response_address = request.address(AttributeType::ResponseAddress);

        if response.change_address() {
            if let Some(alternate) = self.alternate {
                if let Some(target) = response_address.and_then(ipv4_endpoint) {
                    response
                        .add_attribute(Attribute::address(AttributeType::ResponseAddress, target));
                }
                return Delivery::Alternate(alternate);
            }
            tracing::warn!(%source, "Change address requested but no alternate endpoint configured");
        }

        let destination = response_address.unwrap_or(source);
        if response.change_port() {
            Delivery::Ephemeral(destination)
        } else {
            Delivery::Reply(destination)
        }
    }

    /// Forward a peer's response to the client it names
    async fn relay(&self, mut response: MessageHeader, source: SocketAddr) {
        let Some(mapped) = response.address(AttributeType::MappedAddress) else {
            tracing::debug!(%source, "Dropping relayed response without MAPPED-ADDRESS");
            return;
        };
        response.set_change_address(false);

        let destination = response
            .address(AttributeType::ResponseAddress)
            .unwrap_or(mapped);
        tracing::debug!(%source, %destination, "Relaying response for peer");
        self.send(&response, Delivery::Reply(destination)).await;
    }

    async fn send(&self, message: &MessageHeader, delivery: Delivery) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Could not encode response");
                return;
            }
        };
        let destination = delivery.destination();

        let result = match delivery {
            Delivery::Reply(_) => self.socket.send_to(&bytes, destination).await,
            Delivery::Alternate(_) | Delivery::Ephemeral(_) => {
                let bind = SocketAddr::new(self.local_addr.ip(), 0);
                match UdpSocket::bind(bind).await {
                    Ok(socket) => socket.send_to(&bytes, destination).await,
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(_) => tracing::trace!(?delivery, "Response sent"),
            Err(e) => tracing::warn!(%destination, error = %e, "Send failed"),
        }
    }
}

fn error_response(request: &MessageHeader, code: ErrorCode) -> MessageHeader {
    let mut reply = MessageHeader::new(MessageClass::BindingErrorResponse);
    reply.set_transaction_id(request.transaction_id());
    reply.add_attribute(Attribute::error_code(code));
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handler(alternate: Option<SocketAddr>) -> Handler {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_addr = socket.local_addr().unwrap();
        Handler {
            socket,
            local_addr,
            public_ip: "198.51.100.1".parse().unwrap(),
            alternate,
            verifier: IntegrityVerifier::None,
        }
    }

    fn request_with_flags(change_address: bool, change_port: bool) -> MessageHeader {
        let mut request = MessageHeader::with_generated_id(MessageClass::BindingRequest);
        request.add_attribute(Attribute::change_request(change_address, change_port));
        request
    }

    #[tokio::test]
    async fn test_response_addresses_without_alternate() {
        let handler = handler(None).await;
        let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let request = MessageHeader::with_generated_id(MessageClass::BindingRequest);

        let response = handler.build_response(&request, source);
        assert_eq!(response.class(), MessageClass::BindingResponse);
        assert_eq!(response.transaction_id(), request.transaction_id());
        assert_eq!(response.address(AttributeType::MappedAddress), Some(source));
        assert!(!response.has_attribute(AttributeType::ReflectedFrom));

        let own = SocketAddr::new("198.51.100.1".parse().unwrap(), handler.local_addr.port());
        assert_eq!(response.address(AttributeType::ChangedAddress), Some(own));
        assert_eq!(response.address(AttributeType::SourceAddress), Some(own));
    }

    #[tokio::test]
    async fn test_source_address_follows_change_flags() {
        let alternate: SocketAddr = "198.51.100.2:3479".parse().unwrap();
        let handler = handler(Some(alternate)).await;
        let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let port = handler.local_addr.port();

        let response = handler.build_response(&request_with_flags(true, true), source);
        assert_eq!(response.address(AttributeType::ChangedAddress), Some(alternate));
        assert_eq!(response.address(AttributeType::SourceAddress), Some(alternate));
        assert!(response.change_address());
        assert!(response.change_port());

        let response = handler.build_response(&request_with_flags(false, true), source);
        assert_eq!(
            response.address(AttributeType::SourceAddress),
            Some("198.51.100.1:3479".parse().unwrap())
        );

        let response = handler.build_response(&request_with_flags(true, false), source);
        assert_eq!(
            response.address(AttributeType::SourceAddress),
            Some(SocketAddr::new("198.51.100.2".parse().unwrap(), port))
        );
    }

    #[tokio::test]
    async fn test_reflected_from_with_response_address() {
        let handler = handler(None).await;
        let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let target: SocketAddr = "203.0.113.6:50000".parse().unwrap();
        let mut request = MessageHeader::with_generated_id(MessageClass::BindingRequest);
        request.add_attribute(Attribute::address(
            AttributeType::ResponseAddress,
            ipv4_endpoint(target).unwrap(),
        ));

        let mut response = handler.build_response(&request, source);
        assert_eq!(response.address(AttributeType::ReflectedFrom), Some(source));
        assert_eq!(
            handler.plan_delivery(&mut response, &request, source),
            Delivery::Reply(target)
        );
    }

    #[tokio::test]
    async fn test_delivery_plans() {
        let alternate: SocketAddr = "198.51.100.2:3479".parse().unwrap();
        let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();

        let with_alt = handler(Some(alternate)).await;
        let request = request_with_flags(true, false);
        let mut response = with_alt.build_response(&request, source);
        assert_eq!(
            with_alt.plan_delivery(&mut response, &request, source),
            Delivery::Alternate(alternate)
        );

        let without_alt = handler(None).await;
        let mut response = without_alt.build_response(&request, source);
        assert_eq!(
            without_alt.plan_delivery(&mut response, &request, source),
            Delivery::Reply(source)
        );

        let request = request_with_flags(false, true);
        let mut response = without_alt.build_response(&request, source);
        assert_eq!(
            without_alt.plan_delivery(&mut response, &request, source),
            Delivery::Ephemeral(source)
        );
    }

    #[tokio::test]
    async fn test_handoff_carries_response_address() {
        let alternate: SocketAddr = "198.51.100.2:3479".parse().unwrap();
        let handler = handler(Some(alternate)).await;
        let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let target: SocketAddr = "203.0.113.6:50000".parse().unwrap();

        let mut request = request_with_flags(true, true);
        request.add_attribute(Attribute::address(
            AttributeType::ResponseAddress,
            ipv4_endpoint(target).unwrap(),
        ));

        let mut response = handler.build_response(&request, source);
        handler.plan_delivery(&mut response, &request, source);
        assert_eq!(response.address(AttributeType::ResponseAddress), Some(target));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let responder = BindingResponder::start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(responder.is_running());
        assert_ne!(responder.local_addr().port(), 0);

        responder.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!responder.is_running());
    }

    #[test]
    fn test_error_response() {
        let request = MessageHeader::with_generated_id(MessageClass::BindingRequest);
        let reply = error_response(&request, ErrorCode::StaleCredentials);
        assert_eq!(reply.class(), MessageClass::BindingErrorResponse);
        assert_eq!(reply.transaction_id(), request.transaction_id());
        assert_eq!(reply.error().unwrap().code, 430);
    }
}
