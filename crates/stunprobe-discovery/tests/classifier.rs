//! Classifier scenarios against scripted fake servers

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use stunprobe_core::{Attribute, AttributeType, ErrorCode, MessageClass, MessageHeader};
use stunprobe_discovery::{
    BindingTest, ProbeConfig, ProbeState, Scenario, SharedSecret, StunClient,
};
use tokio::net::UdpSocket;

const NAT_MAPPING: &str = "203.0.113.7:40000";

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("tests run on IPv4 loopback"),
    }
}

fn fast_config() -> ProbeConfig {
    ProbeConfig {
        initial_rto: Duration::from_millis(10),
        max_rto: Duration::from_millis(40),
        budget: Duration::from_millis(150),
        local_bind: "127.0.0.1:0".parse().unwrap(),
        ..ProbeConfig::default()
    }
}

fn client_for(server: SocketAddr) -> StunClient {
    StunClient::with_config("127.0.0.1", server.port(), fast_config())
}

/// Start a server that answers the n-th request (0-based, retransmits
/// included) with whatever `script` returns
async fn scripted_server<F>(script: F) -> SocketAddr
where
    F: Fn(usize, &MessageHeader, SocketAddr) -> Option<MessageHeader> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        let mut count = 0;
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = MessageHeader::decode(&buf[..len]) else {
                continue;
            };
            if let Some(response) = script(count, &request, from) {
                let _ = socket.send_to(&response.encode().unwrap(), from).await;
            }
            count += 1;
        }
    });

    addr
}

fn binding_response(
    request: &MessageHeader,
    mapped: SocketAddr,
    changed: Option<SocketAddr>,
) -> MessageHeader {
    let mut response = MessageHeader::new(MessageClass::BindingResponse);
    response.set_transaction_id(request.transaction_id());
    response.add_attribute(Attribute::address(AttributeType::MappedAddress, v4(mapped)));
    if let Some(changed) = changed {
        response.add_attribute(Attribute::address(AttributeType::ChangedAddress, v4(changed)));
    }
    response
}

#[tokio::test]
async fn test_no_response_is_udp_blocked() {
    let server = scripted_server(|_, _, _| None).await;

    let info = client_for(server).bind(None).await;
    assert_eq!(info.scenario(), Scenario::UdpBlocked);
    assert_eq!(info.last_test(), BindingTest::Test1FirstRun);
    assert_eq!(info.error_code(), 0);
    assert!(info.to_string().contains("UDP traffic is blocked"));
}

#[tokio::test]
async fn test_mapped_equals_local_is_not_natted() {
    let server = scripted_server(|_, request, from| Some(binding_response(request, from, None))).await;

    let info = client_for(server).bind_remote_address_only(None).await;
    assert!(!info.is_natted());
    assert_eq!(info.error_code(), 0);
    assert_eq!(info.public_ip(), Some("127.0.0.1".parse().unwrap()));
    assert_eq!(info.local_addresses(), &["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
    assert_eq!(info.last_test(), BindingTest::Test1FirstRun);
}

#[tokio::test]
async fn test_test2_timeout_not_natted_is_open_internet() {
    let server = scripted_server(|n, request, from| {
        (n == 0).then(|| binding_response(request, from, None))
    })
    .await;

    let info = client_for(server).bind(None).await;
    assert!(!info.is_natted());
    assert_eq!(info.scenario(), Scenario::OpenInternet);
    assert_eq!(info.last_test(), BindingTest::Test2);
}

#[tokio::test]
async fn test_test2_timeout_natted_is_symmetric_firewall() {
    let server = scripted_server(|n, request, _| {
        (n == 0).then(|| binding_response(request, NAT_MAPPING.parse().unwrap(), None))
    })
    .await;

    let info = client_for(server).bind(None).await;
    assert!(info.is_natted());
    assert_eq!(info.scenario(), Scenario::SymmetricFirewall);
    assert_eq!(info.last_test(), BindingTest::Test2);
}

#[tokio::test]
async fn test_test2_response_natted_is_full_cone() {
    let server = scripted_server(|_, request, _| {
        Some(binding_response(request, NAT_MAPPING.parse().unwrap(), None))
    })
    .await;

    let info = client_for(server).bind(None).await;
    assert!(info.is_natted());
    assert_eq!(info.scenario(), Scenario::FullConeNat);
    assert_eq!(info.public_address(), Some(NAT_MAPPING.parse().unwrap()));
}

#[tokio::test]
async fn test_test2_response_not_natted_is_open_internet() {
    let server = scripted_server(|_, request, from| Some(binding_response(request, from, None))).await;

    let info = client_for(server).bind(None).await;
    assert_eq!(info.scenario(), Scenario::OpenInternet);
    assert_eq!(info.last_test(), BindingTest::Test2);
}

#[tokio::test]
async fn test_second_mapping_differs_is_symmetric_nat() {
    let alternate = scripted_server(|_, request, _| {
        Some(binding_response(request, "203.0.113.99:40000".parse().unwrap(), None))
    })
    .await;
    let primary: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let state = ProbeState::after_test1a(primary, NAT_MAPPING.parse().unwrap(), Some(alternate), true);
    let step = client_for(primary).test1b(state, None).await;

    assert!(!step.is_continue());
    let info = step.into_info();
    assert_eq!(info.scenario(), Scenario::SymmetricNat);
    assert_eq!(info.last_test(), BindingTest::Test1SecondRun);
}

#[tokio::test]
async fn test_second_mapping_same_ip_continues() {
    let alternate = scripted_server(|_, request, _| {
        Some(binding_response(request, "203.0.113.7:40001".parse().unwrap(), None))
    })
    .await;
    let primary: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let state = ProbeState::after_test1a(primary, NAT_MAPPING.parse().unwrap(), Some(alternate), true);
    let step = client_for(primary).test1b(state, None).await;
    assert!(step.is_continue());
    assert_eq!(step.state().info().scenario(), Scenario::NotKnown);
}

#[tokio::test]
async fn test_changed_address_recorded() {
    let changed: SocketAddr = "198.51.100.2:3479".parse().unwrap();
    let server = scripted_server(move |_, request, from| {
        Some(binding_response(request, from, Some(changed)))
    })
    .await;

    let client = client_for(server);
    let step = client.test1a(ProbeState::new(server), None).await;
    assert!(step.is_continue());
    assert_eq!(step.state().changed_address(), Some(changed));
    assert!(step.state().mapped_address().is_some());
}

#[tokio::test]
async fn test_error_code_propagated() {
    let server = scripted_server(|_, request, _| {
        let mut response = MessageHeader::new(MessageClass::BindingErrorResponse);
        response.set_transaction_id(request.transaction_id());
        response.add_attribute(Attribute::error_code(ErrorCode::GlobalFailure));
        Some(response)
    })
    .await;

    let info = client_for(server).bind(None).await;
    assert_eq!(info.error_code(), 600);
    assert!(info.to_string().starts_with("ERROR: Code: 600"));
}

#[tokio::test]
async fn test_missing_mapped_address_is_client_failure() {
    let server = scripted_server(|_, request, _| {
        let mut response = MessageHeader::new(MessageClass::BindingResponse);
        response.set_transaction_id(request.transaction_id());
        Some(response)
    })
    .await;

    let info = client_for(server).bind(None).await;
    assert_eq!(info.error_code(), 700);
    assert!(info.error().unwrap().message.contains("incomplete response"));
}

#[tokio::test]
async fn test_wrong_mac_is_rejected() {
    let server = scripted_server(|_, request, from| {
        binding_response(request, from, None)
            .with_message_integrity(b"not the shared secret")
            .ok()
    })
    .await;
    let secret = SharedSecret::new("USER-abcd000", vec![0x42; 20]);

    let info = client_for(server).bind(Some(&secret)).await;
    assert_eq!(info.error_code(), 700);
    assert!(info.error().unwrap().message.contains("Wrong HMAC"));
}

#[tokio::test]
async fn test_matching_mac_is_accepted() {
    let password = vec![0x42; 20];
    let key = password.clone();
    let server = scripted_server(move |_, request, from| {
        binding_response(request, from, None)
            .with_message_integrity(&key)
            .ok()
    })
    .await;
    let secret = SharedSecret::new("USER-abcd000", password);

    let info = client_for(server).bind_remote_address_only(Some(&secret)).await;
    assert_eq!(info.error_code(), 0);
    assert!(!info.is_natted());
}

#[tokio::test]
async fn test_stray_transaction_ignored() {
    // First transmission only gets an answer for some other transaction
    let server = scripted_server(|n, request, from| {
        if n == 0 {
            let mut stray = MessageHeader::with_generated_id(MessageClass::BindingResponse);
            stray.add_attribute(Attribute::address(
                AttributeType::MappedAddress,
                v4(NAT_MAPPING.parse().unwrap()),
            ));
            return Some(stray);
        }
        Some(binding_response(request, from, None))
    })
    .await;

    let info = client_for(server).bind_remote_address_only(None).await;
    assert_eq!(info.error_code(), 0);
    assert!(!info.is_natted());
    assert_ne!(info.public_address(), Some(NAT_MAPPING.parse().unwrap()));
}
