//! Reputation service backed by AbuseIPDB and the Tor bulk exit list

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{NetworkRanges, ReputationService};
use crate::config::ReputationConfig;
use crate::error::LookupError;
use crate::models::IpReputation;

#[derive(Debug, Deserialize)]
struct AbuseCheckResponse {
    data: AbuseCheckData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbuseCheckData {
    abuse_confidence_score: u8,
}

struct TorExitList {
    nodes: HashSet<IpAddr>,
    fetched_at: Instant,
}

/// HTTP-backed [`ReputationService`]
pub struct HttpReputationService {
    client: Client,
    abuseipdb_url: String,
    api_key: Option<String>,
    malicious_confidence: u8,
    vpn_ranges: NetworkRanges,
    tor_exit_list_url: String,
    tor_refresh: Duration,
    tor_exits: RwLock<Option<TorExitList>>,
}

impl HttpReputationService {
    pub fn new(config: &ReputationConfig, timeout: Duration) -> Self {
        if config.abuseipdb_api_key.is_none() {
            log::warn!("No AbuseIPDB API key configured; IP reputation will be reported as unknown");
        }
        HttpReputationService {
            client: Client::builder().timeout(timeout).build().unwrap_or_default(),
            abuseipdb_url: config.abuseipdb_url.clone(),
            api_key: config.abuseipdb_api_key.clone(),
            malicious_confidence: config.malicious_confidence,
            vpn_ranges: NetworkRanges::parse_lenient(&config.vpn_ranges),
            tor_exit_list_url: config.tor_exit_list_url.clone(),
            tor_refresh: Duration::from_secs(config.tor_refresh_seconds),
            tor_exits: RwLock::new(None),
        }
    }

    fn parse_ip(ip: &str) -> Result<IpAddr, LookupError> {
        ip.trim()
            .parse()
            .map_err(|_| LookupError::Malformed(format!("invalid IP address: {}", ip)))
    }

    fn verdict(&self, score: u8) -> IpReputation {
        if score >= self.malicious_confidence {
            IpReputation::Malicious
        } else {
            IpReputation::Clean
        }
    }

    /// Parse the plain-text bulk exit list, one address per line
    fn parse_exit_list(body: &str) -> HashSet<IpAddr> {
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.parse().ok())
            .collect()
    }

    async fn fetch_exit_list(&self) -> Result<HashSet<IpAddr>, LookupError> {
        let response = self.client.get(&self.tor_exit_list_url).send().await?;
        if !response.status().is_success() {
            return Err(LookupError::Unavailable(format!(
                "Tor exit list returned {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        let nodes = Self::parse_exit_list(&body);
        log::info!("Loaded {} Tor exit nodes", nodes.len());
        Ok(nodes)
    }

    async fn exit_list_contains(&self, ip: &IpAddr) -> Result<bool, LookupError> {
        {
            let guard = self.tor_exits.read().await;
            if let Some(list) = guard.as_ref() {
                if list.fetched_at.elapsed() < self.tor_refresh {
                    return Ok(list.nodes.contains(ip));
                }
            }
        }

        let mut guard = self.tor_exits.write().await;
        // Another task may have refreshed while we waited for the write lock
        if let Some(list) = guard.as_ref() {
            if list.fetched_at.elapsed() < self.tor_refresh {
                return Ok(list.nodes.contains(ip));
            }
        }

        let nodes = self.fetch_exit_list().await?;
        let found = nodes.contains(ip);
        *guard = Some(TorExitList {
            nodes,
            fetched_at: Instant::now(),
        });
        Ok(found)
    }
}

#[async_trait]
impl ReputationService for HttpReputationService {
    async fn classify(&self, ip: &str, cancel: &CancellationToken) -> Result<IpReputation, LookupError> {
        if cancel.is_cancelled() {
            return Err(LookupError::Cancelled);
        }
        let ip = Self::parse_ip(ip)?;
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(IpReputation::Unknown);
        };

        let response = self
            .client
            .get(&self.abuseipdb_url)
            .header("Key", api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("ipAddress", ip.to_string()), ("maxAgeInDays", "90".to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LookupError::Unavailable(format!(
                "AbuseIPDB returned {}",
                response.status()
            )));
        }

        let body: AbuseCheckResponse = response
            .json()
            .await
            .map_err(|e| LookupError::Malformed(e.to_string()))?;

        Ok(self.verdict(body.data.abuse_confidence_score))
    }

    async fn is_vpn(&self, ip: &str, cancel: &CancellationToken) -> Result<bool, LookupError> {
        if cancel.is_cancelled() {
            return Err(LookupError::Cancelled);
        }
        let ip = Self::parse_ip(ip)?;
        Ok(self.vpn_ranges.contains(ip))
    }

    async fn is_tor_exit_node(&self, ip: &str, cancel: &CancellationToken) -> Result<bool, LookupError> {
        if cancel.is_cancelled() {
            return Err(LookupError::Cancelled);
        }
        let ip = Self::parse_ip(ip)?;
        self.exit_list_contains(&ip).await
    }
}
