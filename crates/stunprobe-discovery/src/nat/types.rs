//! NAT classification results.

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};

/// Connection scenario found by the classifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scenario {
    /// Classification did not reach a verdict
    #[default]
    NotKnown,
    /// No UDP reply at all
    UdpBlocked,
    /// Public address, but unsolicited inbound traffic is filtered
    SymmetricFirewall,
    /// Public address, no filtering
    OpenInternet,
    /// Any external host can reach the mapped endpoint
    FullConeNat,
    /// Different mapping per destination
    SymmetricNat,
    /// Only previously contacted address:port pairs can send back
    RestrictedPortNat,
    /// Only previously contacted addresses can send back
    RestrictedConeNat,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotKnown => write!(f, "Scenario could not be detected"),
            Self::UdpBlocked => write!(f, "UDP traffic is blocked"),
            Self::SymmetricFirewall => write!(f, "Node is behind a Symmetric Firewall"),
            Self::OpenInternet => write!(f, "Node is connected to the open Internet"),
            Self::FullConeNat => write!(f, "Node is behind a Full Cone NAT"),
            Self::SymmetricNat => write!(f, "Node is behind a Symmetric NAT"),
            Self::RestrictedPortNat => write!(f, "Node is behind a Restricted Port NAT"),
            Self::RestrictedConeNat => write!(f, "Node is behind a Restricted Cone NAT"),
        }
    }
}

impl Scenario {
    /// Longer explanation of the mapping and filtering behavior
    #[must_use]
    pub fn details(self) -> &'static [&'static str] {
        match self {
            Self::SymmetricFirewall | Self::SymmetricNat => &[
                "Each request from the same internal IP address and port to a specific destination \
                 IP address and port is mapped to a unique external source IP address and port. If \
                 the same internal host sends a packet with the same source address and port to a \
                 different destination, a different mapping is used.",
                "Only an external host that receives a packet from an internal host can send a \
                 packet back.",
            ],
            Self::FullConeNat => &[
                "Once an internal address (iAddr:iPort) is mapped to an external address \
                 (eAddr:ePort), any packets from iAddr:iPort will be sent through eAddr:ePort.",
                "Any external host can send packets to iAddr:iPort by sending packets to \
                 eAddr:ePort.",
            ],
            Self::RestrictedPortNat => &[
                "Once an internal address (iAddr:iPort) is mapped to an external address \
                 (eAddr:ePort), any packets from iAddr:iPort will be sent through eAddr:ePort.",
                "An external host (hAddr:hPort) can send packets to iAddr:iPort by sending packets \
                 to eAddr:ePort only if iAddr:iPort has previously sent a packet to hAddr:hPort.",
            ],
            Self::RestrictedConeNat => &[
                "Once an internal address (iAddr:iPort) is mapped to an external address \
                 (eAddr:ePort), any packets from iAddr:iPort will be sent through eAddr:ePort.",
                "An external host (hAddr:any) can send packets to iAddr:iPort by sending packets \
                 to eAddr:ePort only if iAddr:iPort has previously sent a packet to hAddr:any. \
                 \"Any\" means the port number doesn't matter.",
            ],
            Self::NotKnown | Self::UdpBlocked | Self::OpenInternet => &[],
        }
    }
}

/// Last classifier step that ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindingTest {
    /// Nothing ran yet
    #[default]
    NoTest,
    /// Test I against the primary server
    Test1FirstRun,
    /// Test II
    Test2,
    /// Test I against the changed address
    Test1SecondRun,
    /// Test III
    Test3,
}

impl std::fmt::Display for BindingTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTest => write!(f, "no test"),
            Self::Test1FirstRun => write!(f, "test 1 first run"),
            Self::Test2 => write!(f, "test 2"),
            Self::Test1SecondRun => write!(f, "test 1 second run"),
            Self::Test3 => write!(f, "test 3"),
        }
    }
}

/// Error recorded by the classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryError {
    /// Protocol error code
    pub code: u16,
    /// Human readable message
    pub message: String,
}

/// Everything a binding run found out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryInfo {
    scenario: Scenario,
    public_address: Option<SocketAddr>,
    local_addresses: Vec<IpAddr>,
    natted: bool,
    error: Option<DiscoveryError>,
    last_test: BindingTest,
}

impl DiscoveryInfo {
    /// Classified scenario
    #[must_use]
    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Public (mapped) endpoint reported by the server
    #[must_use]
    pub fn public_address(&self) -> Option<SocketAddr> {
        self.public_address
    }

    /// Public IP reported by the server
    #[must_use]
    pub fn public_ip(&self) -> Option<IpAddr> {
        self.public_address.map(|a| a.ip())
    }

    /// Local addresses used for probing
    #[must_use]
    pub fn local_addresses(&self) -> &[IpAddr] {
        &self.local_addresses
    }

    /// True if the mapped endpoint differs from the local one
    #[must_use]
    pub fn is_natted(&self) -> bool {
        self.natted
    }

    /// Recorded error, if any
    #[must_use]
    pub fn error(&self) -> Option<&DiscoveryError> {
        self.error.as_ref()
    }

    /// Error code, 0 when no error was recorded
    #[must_use]
    pub fn error_code(&self) -> u16 {
        self.error.as_ref().map_or(0, |e| e.code)
    }

    /// Last classifier step that ran
    #[must_use]
    pub fn last_test(&self) -> BindingTest {
        self.last_test
    }

    pub(crate) fn set_scenario(&mut self, scenario: Scenario) {
        self.scenario = scenario;
    }

    pub(crate) fn set_public_address(&mut self, addr: SocketAddr) {
        self.public_address = Some(addr);
    }

    pub(crate) fn add_local_address(&mut self, ip: IpAddr) {
        if !self.local_addresses.contains(&ip) {
            self.local_addresses.push(ip);
        }
    }

    pub(crate) fn set_natted(&mut self, natted: bool) {
        self.natted = natted;
    }

    pub(crate) fn set_error(&mut self, code: u16, message: impl Into<String>) {
        self.error = Some(DiscoveryError {
            code,
            message: message.into(),
        });
    }

    pub(crate) fn set_last_test(&mut self, test: BindingTest) {
        self.last_test = test;
    }

    /// Render with per-scenario explanations
    #[must_use]
    pub fn to_string_detailed(&self) -> String {
        self.render(true)
    }

    fn render(&self, details: bool) -> String {
        if let Some(err) = &self.error {
            return format!("ERROR: Code: {} [{}]", err.code, err.message);
        }

        let mut out = String::new();
        if self.natted {
            out.push_str("Node natted:\n");
        } else {
            out.push_str("Node not natted:\n");
        }
        let _ = writeln!(out, "  {}", self.scenario);
        if self.scenario == Scenario::UdpBlocked {
            return out;
        }

        if details {
            for line in self.scenario.details() {
                let _ = writeln!(out, "   - {line}");
            }
        }

        match self.public_ip() {
            Some(ip) => {
                let _ = writeln!(out, "  with public IP address: {ip}");
            }
            None => out.push_str("  with public IP address: unknown\n"),
        }
        if !self.local_addresses.is_empty() {
            out.push_str("  and local IP addresses:\n");
            for addr in &self.local_addresses {
                let _ = writeln!(out, "  - {addr}");
            }
        }
        out
    }
}

impl std::fmt::Display for DiscoveryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render(false))
    }
}
