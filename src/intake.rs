//! Request boundary for login attempts
//!
//! Validates an incoming [`LoginRequest`], runs detection and, at the same
//! time, resolves the requester's country. Both are joined only when the
//! response is built; a failed country lookup never affects detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::alerting::AlertQueue;
use crate::config::Config;
use crate::deadline::guarded_lookup;
use crate::detection::scorer::FAR_DISTANCE_KM;
use crate::detection::{DetectionOrchestrator, DetectionOutcome, NetworkSignalAggregator, RiskScorer};
use crate::error::DetectionError;
use crate::geolocation::{CountryResolver, GeoDistanceEstimator, GeoIpService, NominatimGeocoder};
use crate::models::LoginRequest;
use crate::persistence::{CachedHistoryStore, HistoryStore, InMemoryCountCache, SqliteLoginStore};
use crate::reputation::HttpReputationService;
use crate::tasks::BackgroundTasks;

/// Boolean risk factors reported back to the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub device_mismatch: bool,
    pub otp_replay: bool,
    pub geo_distance_high: bool,
    pub high_login_freq: bool,
    pub multiple_ips: bool,
}

/// Response for a processed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub message: String,
    pub user_id: String,
    pub ip_address: String,
    pub is_phishing: bool,
    pub risk_score: u32,
    pub risk_factors: RiskFactors,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub country: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
}

impl DetectionResponse {
    pub fn new(outcome: &DetectionOutcome, country: Option<String>) -> Self {
        let attempt = &outcome.attempt;
        DetectionResponse {
            message: "Login attempt recorded".to_string(),
            user_id: attempt.user_id.clone(),
            ip_address: attempt.ip_address.clone(),
            is_phishing: attempt.is_phishing_risk,
            risk_score: attempt.risk_score,
            risk_factors: RiskFactors {
                device_mismatch: attempt.device_mismatch,
                otp_replay: attempt.otp_replay_detected,
                geo_distance_high: attempt.distance_from_last > FAR_DISTANCE_KM,
                high_login_freq: attempt.login_frequency_high,
                multiple_ips: attempt.multiple_ips_detected,
            },
            reasons: outcome.reasons.clone(),
            country,
            created_at: attempt.created_at,
        }
    }
}

/// Generic failure handed back to the caller; internal detail is only logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureResponse {
    pub error: String,
    /// HTTP-style status: 400 for invalid input, 500 otherwise
    pub status: u16,
}

impl From<&DetectionError> for FailureResponse {
    fn from(err: &DetectionError) -> Self {
        FailureResponse {
            error: err.public_message().to_string(),
            status: if err.is_client_error() { 400 } else { 500 },
        }
    }
}

pub struct LoginIntake {
    orchestrator: Arc<DetectionOrchestrator>,
    countries: Option<Arc<dyn CountryResolver>>,
    timeout: Duration,
}

impl LoginIntake {
    pub fn new(
        orchestrator: Arc<DetectionOrchestrator>,
        countries: Option<Arc<dyn CountryResolver>>,
        timeout: Duration,
    ) -> Self {
        LoginIntake {
            orchestrator,
            countries,
            timeout,
        }
    }

    /// Wire the production collaborators described by `config` around `store`
    ///
    /// `counts` is shared with the caller so it can purge expired entries.
    pub fn from_config(
        config: &Config,
        store: SqliteLoginStore,
        counts: Arc<InMemoryCountCache>,
        tasks: BackgroundTasks,
        alerts: Option<AlertQueue>,
    ) -> Self {
        let detection = &config.detection;
        let timeout = detection.collaborator_timeout();

        let history: Arc<dyn HistoryStore> = Arc::new(CachedHistoryStore::new(
            Arc::new(store.clone()),
            counts,
            Duration::from_secs(config.storage.count_cache_ttl_seconds),
            vec![detection.network_window(), detection.backup_window()],
        ));
        let geocoder = Arc::new(NominatimGeocoder::new(&config.geolocation, timeout));
        let scorer = RiskScorer::new(
            Arc::new(GeoDistanceEstimator::new(geocoder, timeout)),
            detection.lookup_failure_policy,
            timeout,
        );
        let network = NetworkSignalAggregator::new(
            history.clone(),
            Arc::new(HttpReputationService::new(&config.reputation, timeout)),
            detection,
        );

        let mut orchestrator =
            DetectionOrchestrator::new(Arc::new(store), history, scorer, network, tasks, detection);
        if let Some(queue) = alerts {
            orchestrator = orchestrator.with_alerts(queue);
        }

        let countries: Option<Arc<dyn CountryResolver>> = match &config.geolocation.geoip_db_path {
            Some(path) => match GeoIpService::new(path) {
                Ok(service) => Some(Arc::new(service)),
                Err(e) => {
                    log::warn!("GeoIP disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        LoginIntake::new(Arc::new(orchestrator), countries, timeout)
    }

    /// Process one request end to end
    pub async fn handle(
        &self,
        request: LoginRequest,
        cancel: &CancellationToken,
    ) -> Result<DetectionResponse, FailureResponse> {
        let attempt = request.into_attempt(Utc::now()).map_err(|e| {
            log::warn!("Rejected login request: {}", e);
            FailureResponse::from(&e)
        })?;

        let ip = attempt.ip_address.clone();
        let (country, detected) = tokio::join!(
            self.resolve_country(&ip, cancel),
            self.orchestrator.detect(attempt, cancel),
        );

        match detected {
            Ok(outcome) => Ok(DetectionResponse::new(&outcome, country)),
            Err(e) => Err(FailureResponse::from(&e)),
        }
    }

    async fn resolve_country(&self, ip: &str, cancel: &CancellationToken) -> Option<String> {
        let resolver = self.countries.as_ref()?;
        match guarded_lookup(cancel, self.timeout, resolver.country(ip, cancel)).await {
            Ok(country) => Some(country),
            Err(e) => {
                log::warn!("GeoIP lookup failed for IP {}: {}", ip, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::error::LookupError;
    use crate::geolocation::GeoResolver;
    use crate::models::IpReputation;
    use crate::reputation::ReputationService;
    use async_trait::async_trait;

    struct NoDistance;

    #[async_trait]
    impl GeoResolver for NoDistance {
        async fn distance_km(&self, _from: &str, _to: &str, _cancel: &CancellationToken) -> Result<f64, LookupError> {
            Ok(0.0)
        }
    }

    struct TorReputation;

    #[async_trait]
    impl ReputationService for TorReputation {
        async fn classify(&self, _ip: &str, _cancel: &CancellationToken) -> Result<IpReputation, LookupError> {
            Ok(IpReputation::Clean)
        }

        async fn is_vpn(&self, _ip: &str, _cancel: &CancellationToken) -> Result<bool, LookupError> {
            Ok(false)
        }

        async fn is_tor_exit_node(&self, _ip: &str, _cancel: &CancellationToken) -> Result<bool, LookupError> {
            Ok(true)
        }
    }

    struct StaticCountry(Option<&'static str>);

    #[async_trait]
    impl CountryResolver for StaticCountry {
        async fn country(&self, ip: &str, _cancel: &CancellationToken) -> Result<String, LookupError> {
            self.0
                .map(String::from)
                .ok_or_else(|| LookupError::NotFound(ip.to_string()))
        }
    }

    fn intake(country: Option<&'static str>) -> (LoginIntake, SqliteLoginStore) {
        let config = DetectionConfig::default();
        let sqlite = SqliteLoginStore::in_memory().unwrap();
        let history: Arc<dyn HistoryStore> = Arc::new(sqlite.clone());
        let orchestrator = DetectionOrchestrator::new(
            Arc::new(sqlite.clone()),
            history.clone(),
            RiskScorer::new(Arc::new(NoDistance), config.lookup_failure_policy, config.collaborator_timeout()),
            NetworkSignalAggregator::new(history, Arc::new(TorReputation), &config),
            BackgroundTasks::new(),
            &config,
        );
        let intake = LoginIntake::new(
            Arc::new(orchestrator),
            Some(Arc::new(StaticCountry(country))),
            config.collaborator_timeout(),
        );
        (intake, sqlite)
    }

    fn request() -> LoginRequest {
        LoginRequest {
            user_id: "alice".to_string(),
            ip_address: "185.220.101.1".to_string(),
            device_id: "laptop".to_string(),
            location: "Nairobi".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_response_shape() {
        let (intake, _store) = intake(Some("Germany"));

        let response = intake.handle(request(), &CancellationToken::new()).await.unwrap();

        assert_eq!(response.message, "Login attempt recorded");
        assert_eq!(response.risk_score, 30);
        assert!(!response.is_phishing);
        assert_eq!(response.reasons, vec!["Tor network detected".to_string()]);
        assert_eq!(response.country.as_deref(), Some("Germany"));
        assert_eq!(response.risk_factors, RiskFactors::default());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["risk_factors"]["geo_distance_high"], false);
        assert_eq!(json["is_phishing"], false);
    }

    #[tokio::test]
    async fn test_country_failure_does_not_affect_detection() {
        let (intake, store) = intake(None);

        let response = intake.handle(request(), &CancellationToken::new()).await.unwrap();

        assert!(response.country.is_none());
        assert_eq!(response.risk_score, 30);
        assert_eq!(store.count_all().unwrap(), 1);
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("country"));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_pipeline() {
        let (intake, store) = intake(Some("Germany"));
        let mut req = request();
        req.device_id.clear();

        let failure = intake.handle(req, &CancellationToken::new()).await.unwrap_err();

        assert_eq!(failure.status, 400);
        assert_eq!(failure.error, "Invalid login attempt");
        assert_eq!(store.count_all().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_generic() {
        let (intake, store) = intake(Some("Germany"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = intake.handle(request(), &cancel).await.unwrap_err();

        assert_eq!(failure.status, 500);
        assert_eq!(failure.error, "Login attempt could not be processed");
        assert_eq!(store.count_all().unwrap(), 0);
    }
}
