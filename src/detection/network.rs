//! Network trust signals
//!
//! Three independent checks run as their own tokio tasks: login frequency
//! and IP diversity over the trailing window, and the reputation of the
//! source IP (abuse verdict, VPN range, Tor exit). The aggregator waits
//! for all three, then merges their results in a fixed order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::config::{DetectionConfig, LookupFailurePolicy};
use crate::deadline::{guarded, guarded_lookup};
use crate::error::DetectionError;
use crate::models::{IpReputation, LoginAttempt, NetworkAnalysisResult};
use crate::persistence::HistoryStore;
use crate::reputation::ReputationService;

const HIGH_FREQUENCY_POINTS: u32 = 20;
const MULTIPLE_IPS_POINTS: u32 = 20;
const MALICIOUS_IP_POINTS: u32 = 50;
const VPN_POINTS: u32 = 15;
const TOR_POINTS: u32 = 30;

/// Merged outcome of the network checks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkAssessment {
    pub score: u32,
    pub reasons: Vec<String>,
    pub analysis: NetworkAnalysisResult,
    pub login_frequency_high: bool,
    pub multiple_ips: bool,
}

type ReputationSignals = (
    Result<IpReputation, DetectionError>,
    Result<bool, DetectionError>,
    Result<bool, DetectionError>,
);

/// Runs the network checks concurrently and scores the result
pub struct NetworkSignalAggregator {
    history: Arc<dyn HistoryStore>,
    reputation: Arc<dyn ReputationService>,
    window: chrono::Duration,
    max_logins: u64,
    max_unique_ips: u64,
    policy: LookupFailurePolicy,
    timeout: Duration,
}

impl NetworkSignalAggregator {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        reputation: Arc<dyn ReputationService>,
        config: &DetectionConfig,
    ) -> Self {
        NetworkSignalAggregator {
            history,
            reputation,
            window: config.network_window(),
            max_logins: config.max_logins_per_window,
            max_unique_ips: config.max_unique_ips_per_window,
            policy: config.lookup_failure_policy,
            timeout: config.collaborator_timeout(),
        }
    }

    /// Gather and score the network signals for `attempt`
    ///
    /// All three checks are awaited before scoring. If `cancel` fires
    /// first, the outstanding tasks are aborted and `Cancelled` returned.
    pub async fn analyze(
        &self,
        attempt: &LoginAttempt,
        cancel: &CancellationToken,
    ) -> Result<NetworkAssessment, DetectionError> {
        let logins = tokio::spawn(self.login_count(attempt, cancel.clone()));
        let ips = tokio::spawn(self.unique_ip_count(attempt, cancel.clone()));
        let reputation = tokio::spawn(self.reputation_signals(attempt, cancel.clone()));
        let aborts = [logins.abort_handle(), ips.abort_handle(), reputation.abort_handle()];

        let (logins, ips, reputation) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                for handle in &aborts {
                    handle.abort();
                }
                log::debug!("Network checks for {} abandoned on cancellation", attempt.user_id);
                return Err(DetectionError::Cancelled);
            }
            joined = async { tokio::join!(logins, ips, reputation) } => joined,
        };

        let (reputation, vpn, tor) = reputation.map_err(task_fault)?;

        let analysis = NetworkAnalysisResult {
            login_count: self.settle("login frequency", logins.map_err(task_fault)?)?.unwrap_or_default(),
            unique_ip_count: self.settle("IP diversity", ips.map_err(task_fault)?)?.unwrap_or_default(),
            ip_reputation: self.settle("IP reputation", reputation)?.unwrap_or_default(),
            vpn_detected: self.settle("VPN check", vpn)?.unwrap_or_default(),
            tor_exit_node: self.settle("Tor check", tor)?.unwrap_or_default(),
        };

        Ok(self.merge(analysis))
    }

    fn merge(&self, analysis: NetworkAnalysisResult) -> NetworkAssessment {
        let mut assessment = NetworkAssessment::default();

        if analysis.login_count > self.max_logins {
            assessment.login_frequency_high = true;
            assessment.score += HIGH_FREQUENCY_POINTS;
            assessment.reasons.push("High login frequency detected".to_string());
        }
        if analysis.unique_ip_count > self.max_unique_ips {
            assessment.multiple_ips = true;
            assessment.score += MULTIPLE_IPS_POINTS;
            assessment.reasons.push("Multiple IPs detected".to_string());
        }
        if analysis.ip_reputation == IpReputation::Malicious {
            assessment.score += MALICIOUS_IP_POINTS;
            assessment.reasons.push("IP flagged as malicious".to_string());
        }
        if analysis.vpn_detected {
            assessment.score += VPN_POINTS;
            assessment.reasons.push("VPN detected".to_string());
        }
        if analysis.tor_exit_node {
            assessment.score += TOR_POINTS;
            assessment.reasons.push("Tor network detected".to_string());
        }

        assessment.analysis = analysis;
        assessment
    }

    /// Apply the failure policy to one check's result
    fn settle<T>(&self, check: &str, result: Result<T, DetectionError>) -> Result<Option<T>, DetectionError> {
        match result.map_err(DetectionError::normalized) {
            Ok(value) => Ok(Some(value)),
            Err(DetectionError::Cancelled) => Err(DetectionError::Cancelled),
            Err(e) if self.policy.network_fails_fast() => {
                log::error!("{} check failed: {}", check, e);
                Err(e)
            }
            Err(e) => {
                log::warn!("{} check failed, contributing nothing: {}", check, e);
                Ok(None)
            }
        }
    }

    fn login_count(
        &self,
        attempt: &LoginAttempt,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<u64, DetectionError>> + Send + 'static {
        let history = self.history.clone();
        let (user_id, window, as_of, timeout) =
            (attempt.user_id.clone(), self.window, attempt.created_at, self.timeout);
        async move {
            let count = guarded(
                &cancel,
                timeout,
                history.count_in_window(&user_id, window, as_of, &cancel),
            )
            .await??;
            Ok(count)
        }
    }

    fn unique_ip_count(
        &self,
        attempt: &LoginAttempt,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<u64, DetectionError>> + Send + 'static {
        let history = self.history.clone();
        let (user_id, window, as_of, timeout) =
            (attempt.user_id.clone(), self.window, attempt.created_at, self.timeout);
        async move {
            let count = guarded(
                &cancel,
                timeout,
                history.count_distinct_ips_in_window(&user_id, window, as_of, &cancel),
            )
            .await??;
            Ok(count)
        }
    }

    fn reputation_signals(
        &self,
        attempt: &LoginAttempt,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = ReputationSignals> + Send + 'static {
        let reputation = self.reputation.clone();
        let (ip, timeout) = (attempt.ip_address.clone(), self.timeout);
        async move {
            let (verdict, vpn, tor) = tokio::join!(
                guarded_lookup(&cancel, timeout, reputation.classify(&ip, &cancel)),
                guarded_lookup(&cancel, timeout, reputation.is_vpn(&ip, &cancel)),
                guarded_lookup(&cancel, timeout, reputation.is_tor_exit_node(&ip, &cancel)),
            );
            (
                verdict.map_err(DetectionError::from),
                vpn.map_err(DetectionError::from),
                tor.map_err(DetectionError::from),
            )
        }
    }
}

fn task_fault(e: JoinError) -> DetectionError {
    if e.is_panic() {
        DetectionError::Internal("network check panicked".to_string())
    } else {
        DetectionError::Internal(format!("network check task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use crate::persistence::PersistenceError;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    struct FixedHistory {
        logins: Result<u64, ()>,
        ips: u64,
    }

    #[async_trait]
    impl HistoryStore for FixedHistory {
        async fn recent_attempts(
            &self,
            _user_id: &str,
            _limit: usize,
            _as_of: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> Result<Vec<LoginAttempt>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn count_in_window(
            &self,
            _user_id: &str,
            _window: chrono::Duration,
            _as_of: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> Result<u64, PersistenceError> {
            self.logins
                .map_err(|_| PersistenceError::InvalidData("count unavailable".to_string()))
        }

        async fn count_distinct_ips_in_window(
            &self,
            _user_id: &str,
            _window: chrono::Duration,
            _as_of: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> Result<u64, PersistenceError> {
            Ok(self.ips)
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Answer(IpReputation, bool, bool),
        FailClassify,
        Hang,
        Panic,
    }

    struct FakeReputation(Behavior);

    #[async_trait]
    impl ReputationService for FakeReputation {
        async fn classify(&self, _ip: &str, _cancel: &CancellationToken) -> Result<IpReputation, LookupError> {
            match self.0 {
                Behavior::Answer(rep, _, _) => Ok(rep),
                Behavior::FailClassify => Err(LookupError::Unavailable("AbuseIPDB returned 503".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(IpReputation::Clean)
                }
                Behavior::Panic => panic!("reputation backend exploded"),
            }
        }

        async fn is_vpn(&self, _ip: &str, _cancel: &CancellationToken) -> Result<bool, LookupError> {
            match self.0 {
                Behavior::Answer(_, vpn, _) => Ok(vpn),
                _ => Ok(true),
            }
        }

        async fn is_tor_exit_node(&self, _ip: &str, _cancel: &CancellationToken) -> Result<bool, LookupError> {
            match self.0 {
                Behavior::Answer(_, _, tor) => Ok(tor),
                _ => Ok(false),
            }
        }
    }

    fn attempt() -> LoginAttempt {
        LoginAttempt {
            id: None,
            user_id: "alice".to_string(),
            ip_address: "203.0.113.7".to_string(),
            device_id: "laptop".to_string(),
            location: "Nairobi".to_string(),
            user_agent: String::new(),
            otp_code_hash: String::new(),
            success: true,
            distance_from_last: 0.0,
            risk_score: 0,
            device_mismatch: false,
            otp_replay_detected: false,
            login_frequency_high: false,
            multiple_ips_detected: false,
            is_phishing_risk: false,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn aggregator(
        logins: Result<u64, ()>,
        ips: u64,
        behavior: Behavior,
        config: DetectionConfig,
    ) -> NetworkSignalAggregator {
        NetworkSignalAggregator::new(
            Arc::new(FixedHistory { logins, ips }),
            Arc::new(FakeReputation(behavior)),
            &config,
        )
    }

    #[tokio::test]
    async fn test_busy_malicious_ip_scores_ninety() {
        let agg = aggregator(
            Ok(6),
            3,
            Behavior::Answer(IpReputation::Malicious, false, false),
            DetectionConfig::default(),
        );

        let result = agg.analyze(&attempt(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.score, 90);
        assert!(result.login_frequency_high);
        assert!(result.multiple_ips);
        assert_eq!(result.analysis.login_count, 6);
        assert_eq!(result.analysis.unique_ip_count, 3);
        assert_eq!(
            result.reasons,
            vec![
                "High login frequency detected".to_string(),
                "Multiple IPs detected".to_string(),
                "IP flagged as malicious".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_thresholds_are_strict() {
        let agg = aggregator(
            Ok(5),
            2,
            Behavior::Answer(IpReputation::Clean, false, false),
            DetectionConfig::default(),
        );

        let result = agg.analyze(&attempt(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.score, 0);
        assert!(!result.login_frequency_high);
        assert!(!result.multiple_ips);
        assert!(result.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_vpn_and_tor() {
        let agg = aggregator(
            Ok(0),
            1,
            Behavior::Answer(IpReputation::Unknown, true, true),
            DetectionConfig::default(),
        );

        let result = agg.analyze(&attempt(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.score, 45);
        assert!(result.analysis.vpn_detected);
        assert!(result.analysis.tor_exit_node);
        assert_eq!(
            result.reasons,
            vec!["VPN detected".to_string(), "Tor network detected".to_string()]
        );
    }

    #[tokio::test]
    async fn test_any_failed_check_fails_by_default() {
        let failing_count = aggregator(
            Err(()),
            1,
            Behavior::Answer(IpReputation::Clean, false, false),
            DetectionConfig::default(),
        );
        let err = failing_count.analyze(&attempt(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DetectionError::Persistence(_)));

        let failing_reputation = aggregator(Ok(1), 1, Behavior::FailClassify, DetectionConfig::default());
        let err = failing_reputation
            .analyze(&attempt(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Lookup(LookupError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_degrade_policy_keeps_partial_score() {
        let config = DetectionConfig {
            lookup_failure_policy: LookupFailurePolicy::Degrade,
            ..Default::default()
        };
        let agg = aggregator(Err(()), 3, Behavior::FailClassify, config);

        let result = agg.analyze(&attempt(), &CancellationToken::new()).await.unwrap();

        // IP diversity and the VPN check still count
        assert_eq!(result.score, 20 + 15);
        assert_eq!(result.analysis.login_count, 0);
        assert_eq!(result.analysis.ip_reputation, IpReputation::Unknown);
    }

    #[tokio::test]
    async fn test_cancellation_abandons_join() {
        let config = DetectionConfig {
            collaborator_timeout_ms: 60_000,
            ..Default::default()
        };
        let agg = aggregator(Ok(1), 1, Behavior::Hang, config);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = agg.analyze(&attempt(), &cancel).await.unwrap_err();
        assert!(matches!(err, DetectionError::Cancelled));
    }

    #[tokio::test]
    async fn test_stuck_reputation_times_out() {
        let config = DetectionConfig {
            collaborator_timeout_ms: 20,
            ..Default::default()
        };
        let agg = aggregator(Ok(1), 1, Behavior::Hang, config);

        let err = agg.analyze(&attempt(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DetectionError::Lookup(LookupError::TimedOut)));
    }

    #[tokio::test]
    async fn test_panicking_check_is_internal_fault() {
        let agg = aggregator(Ok(1), 1, Behavior::Panic, DetectionConfig::default());

        let err = agg.analyze(&attempt(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DetectionError::Internal(_)));
    }
}
