//! IP reputation collaborators
//!
//! Classifies a source IP as clean, malicious or unknown and tests it
//! against VPN provider ranges and the Tor exit node list.

pub mod http_service;
pub mod ranges;

pub use http_service::HttpReputationService;
pub use ranges::NetworkRanges;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LookupError;
use crate::models::IpReputation;

/// External classifier for IP trustworthiness
#[async_trait]
pub trait ReputationService: Send + Sync {
    async fn classify(&self, ip: &str, cancel: &CancellationToken) -> Result<IpReputation, LookupError>;

    async fn is_vpn(&self, ip: &str, cancel: &CancellationToken) -> Result<bool, LookupError>;

    async fn is_tor_exit_node(&self, ip: &str, cancel: &CancellationToken) -> Result<bool, LookupError>;
}
