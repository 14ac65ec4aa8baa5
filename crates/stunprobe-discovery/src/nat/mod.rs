//! NAT classification
//!
//! Runs the RFC 3489 test sequence against one server and reports the
//! connection scenario:
//!
//! - **Test I**: plain request to the primary server; no answer means UDP
//!   is blocked, otherwise the mapped endpoint tells whether the node is
//!   behind a NAT
//! - **Test II**: second request to the primary server; its outcome ends
//!   classification as open Internet, symmetric firewall or full cone
//! - **Test I (second run)** and **Test III**: mapping and filtering
//!   checks against the alternate endpoint and the primary server
//!
//! # Example
//!
//! ```rust,no_run
//! use stunprobe_discovery::nat::StunClient;
//!
//! # async fn example() {
//! let client = StunClient::new("stun.example.org", 3478);
//! let info = client.bind(None).await;
//! println!("Last test was: {}", info.last_test());
//! println!("{info}");
//! # }
//! ```

mod client;
mod types;

pub use client::{ProbeConfig, ProbeError, ProbeState, Step, StunClient};
pub use types::{BindingTest, DiscoveryError, DiscoveryInfo, Scenario};
