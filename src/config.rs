use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the otpguard daemon and CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attempt feed configuration
    pub input: InputConfig,
    /// Detection thresholds and policies
    pub detection: DetectionConfig,
    /// Attempt store configuration
    pub storage: StorageConfig,
    /// Geocoding and GeoIP configuration
    pub geolocation: GeolocationConfig,
    /// IP reputation configuration
    pub reputation: ReputationConfig,
    /// Alert channels
    pub alerting: AlertConfig,
    /// Output configuration
    pub output: OutputConfig,
}

/// Attempt feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Path to the attempt feed (JSON lines or key=value lines)
    pub file_path: PathBuf,
    /// Start from the beginning of the feed instead of tailing new lines
    pub from_start: bool,
}

/// How lookup failures inside the scoring rules are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupFailurePolicy {
    /// Geo distance failures are skipped, network check failures abort
    #[default]
    GeoDegradeNetworkFailFast,
    /// Any failed lookup contributes nothing and is logged
    Degrade,
    /// Any failed lookup aborts the detection run
    FailFast,
}

impl LookupFailurePolicy {
    /// Whether a failed geo distance lookup aborts detection
    pub fn geo_fails_fast(self) -> bool {
        matches!(self, LookupFailurePolicy::FailFast)
    }

    /// Whether a failed network sub-check aborts detection
    pub fn network_fails_fast(self) -> bool {
        !matches!(self, LookupFailurePolicy::Degrade)
    }
}

/// Detection thresholds and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Attempts scoring strictly above this are flagged as phishing risk
    pub phishing_threshold: u32,
    /// Maximum history records fed into the baseline
    pub history_limit: usize,
    /// Trailing window for login frequency and IP diversity, in minutes
    pub network_window_minutes: i64,
    /// Secondary window kept warm in the count cache, in minutes
    pub backup_window_minutes: i64,
    /// Login count above which frequency is considered high
    pub max_logins_per_window: u64,
    /// Distinct IP count above which IP diversity is flagged
    pub max_unique_ips_per_window: u64,
    /// Per-call timeout for every external collaborator, in milliseconds
    pub collaborator_timeout_ms: u64,
    /// Degrade vs fail-fast behavior on lookup failures
    pub lookup_failure_policy: LookupFailurePolicy,
}

impl DetectionConfig {
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn network_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.network_window_minutes)
    }

    pub fn backup_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.backup_window_minutes)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            phishing_threshold: 75,
            history_limit: 50,
            network_window_minutes: 60,
            backup_window_minutes: 30,
            max_logins_per_window: 5,
            max_unique_ips_per_window: 2,
            collaborator_timeout_ms: 5_000,
            lookup_failure_policy: LookupFailurePolicy::default(),
        }
    }
}

/// Attempt store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    pub db_path: PathBuf,
    /// How long window counts are served from cache, in seconds
    pub count_cache_ttl_seconds: u64,
    /// Attempts older than this are pruned by maintenance
    pub retention_days: i64,
    /// Interval between maintenance runs in the daemon, in seconds
    pub prune_interval_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: PathBuf::from("otpguard.db"),
            count_cache_ttl_seconds: 3_600,
            retention_days: 90,
            prune_interval_seconds: 3_600,
        }
    }
}

/// Geocoding and GeoIP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocationConfig {
    /// MaxMind GeoLite2 database used for country resolution
    pub geoip_db_path: Option<PathBuf>,
    /// Nominatim-compatible search endpoint for location labels
    pub geocoder_url: String,
    /// User agent sent to the geocoder (required by Nominatim's usage policy)
    pub user_agent: String,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        GeolocationConfig {
            geoip_db_path: Some(PathBuf::from("GeoLite2-Country.mmdb")),
            geocoder_url: "https://nominatim.openstreetmap.org/search".to_string(),
            user_agent: "otpguard/0.1".to_string(),
        }
    }
}

/// IP reputation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// AbuseIPDB check endpoint
    pub abuseipdb_url: String,
    /// AbuseIPDB API key; without one every IP classifies as unknown
    pub abuseipdb_api_key: Option<String>,
    /// Abuse confidence score at or above which an IP is malicious
    pub malicious_confidence: u8,
    /// CIDR ranges belonging to known VPN providers
    pub vpn_ranges: Vec<String>,
    /// Tor bulk exit list
    pub tor_exit_list_url: String,
    /// How long a fetched exit list is trusted, in seconds
    pub tor_refresh_seconds: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            abuseipdb_url: "https://api.abuseipdb.com/api/v2/check".to_string(),
            abuseipdb_api_key: None,
            malicious_confidence: 50,
            vpn_ranges: Vec::new(),
            tor_exit_list_url: "https://check.torproject.org/torbulkexitlist".to_string(),
            tor_refresh_seconds: 3_600,
        }
    }
}

/// Alert channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Master switch for alert delivery
    pub enabled: bool,
    /// Bound of the in-process alert queue
    pub queue_capacity: usize,
    pub slack: Option<SlackConfig>,
    pub discord: Option<DiscordConfig>,
    pub webhooks: Vec<WebhookConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            enabled: true,
            queue_capacity: 100,
            slack: None,
            discord: None,
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    pub channel: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    /// POST (default) or PUT
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (if format is not "console")
    pub file_path: Option<PathBuf>,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            file_path: PathBuf::from("/var/log/otpguard/attempts.jsonl"),
            from_start: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: "jsonl".to_string(),
            file_path: Some(PathBuf::from("detections.jsonl")),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Fill secrets from the environment when the file leaves them out
    pub fn apply_env_overrides(&mut self) {
        if self.reputation.abuseipdb_api_key.is_none() {
            if let Ok(key) = std::env::var("ABUSEIPDB_API_KEY") {
                if !key.is_empty() {
                    self.reputation.abuseipdb_api_key = Some(key);
                }
            }
        }
        if self.alerting.slack.is_none() {
            if let Ok(url) = std::env::var("SLACK_WEBHOOK_URL") {
                if !url.is_empty() {
                    self.alerting.slack = Some(SlackConfig {
                        webhook_url: url,
                        channel: None,
                        username: None,
                    });
                }
            }
        }
    }
}
