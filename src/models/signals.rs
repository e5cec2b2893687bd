use serde::{Deserialize, Serialize};
use std::fmt;

/// Statistical summary of a user's recent login pattern
///
/// All zero / empty when there is not enough history to compare against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehavioralStats {
    /// Mean seconds between consecutive logins
    pub avg_login_interval: f64,
    /// Population standard deviation of the intervals
    pub std_dev_interval: f64,
    pub most_common_location: String,
    pub most_common_device: String,
}

impl BehavioralStats {
    /// True for the cold-start baseline
    pub fn is_empty(&self) -> bool {
        self.avg_login_interval == 0.0
            && self.std_dev_interval == 0.0
            && self.most_common_location.is_empty()
            && self.most_common_device.is_empty()
    }
}

/// Verdict from the IP reputation service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpReputation {
    Clean,
    Malicious,
    #[default]
    Unknown,
}

impl fmt::Display for IpReputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IpReputation::Clean => "clean",
            IpReputation::Malicious => "malicious",
            IpReputation::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Network trust signals gathered for one attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkAnalysisResult {
    /// Logins by the user in the trailing window
    pub login_count: u64,
    /// Distinct source IPs used by the user in the trailing window
    pub unique_ip_count: u64,
    pub ip_reputation: IpReputation,
    pub vpn_detected: bool,
    pub tor_exit_node: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stats_are_cold_start() {
        assert!(BehavioralStats::default().is_empty());
        let stats = BehavioralStats {
            most_common_device: "phone".to_string(),
            ..Default::default()
        };
        assert!(!stats.is_empty());
    }

    #[test]
    fn test_reputation_labels() {
        assert_eq!(IpReputation::Malicious.to_string(), "malicious");
        assert_eq!(IpReputation::default(), IpReputation::Unknown);
        let parsed: IpReputation = serde_json::from_str("\"clean\"").unwrap();
        assert_eq!(parsed, IpReputation::Clean);
    }
}
