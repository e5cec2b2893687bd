use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::LookupFailurePolicy;
use crate::deadline::guarded_lookup;
use crate::error::{DetectionError, LookupError};
use crate::geolocation::GeoResolver;
use crate::models::{BehavioralStats, LoginAttempt};

/// Distance above which a location change is treated as unusual
pub const FAR_DISTANCE_KM: f64 = 5_000.0;
/// Distance above which a location change adds a minor contribution
pub const MODERATE_DISTANCE_KM: f64 = 1_000.0;
/// Timing z-score magnitude beyond which a login is off-pattern
pub const TIMING_Z_THRESHOLD: f64 = 2.0;

const FAR_DISTANCE_POINTS: u32 = 30;
const MODERATE_DISTANCE_POINTS: u32 = 15;
const OTP_REPLAY_POINTS: u32 = 40;
const DEVICE_MISMATCH_POINTS: u32 = 25;
const TIMING_ANOMALY_POINTS: u32 = 20;

/// Outcome of the heuristic rules for one attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleAssessment {
    pub score: u32,
    pub reasons: Vec<String>,
}

impl RuleAssessment {
    fn add(&mut self, points: u32, reason: Option<&str>) {
        self.score += points;
        if let Some(reason) = reason {
            self.reasons.push(reason.to_string());
        }
    }
}

/// Applies the deterministic rules to an attempt, its predecessor and the baseline
///
/// Rules are independent and additive. Scoring writes the attempt's
/// `distance_from_last`, `otp_replay_detected` and `device_mismatch`
/// fields.
pub struct RiskScorer {
    resolver: Arc<dyn GeoResolver>,
    policy: LookupFailurePolicy,
    timeout: Duration,
}

impl RiskScorer {
    pub fn new(resolver: Arc<dyn GeoResolver>, policy: LookupFailurePolicy, timeout: Duration) -> Self {
        RiskScorer {
            resolver,
            policy,
            timeout,
        }
    }

    pub async fn score(
        &self,
        attempt: &mut LoginAttempt,
        last: Option<&LoginAttempt>,
        stats: &BehavioralStats,
        cancel: &CancellationToken,
    ) -> Result<RuleAssessment, DetectionError> {
        let mut assessment = RuleAssessment::default();

        // Nothing to compare against for a user's first login
        let Some(last) = last else {
            return Ok(assessment);
        };

        if let Some(distance) = self.distance(&last.location, &attempt.location, cancel).await? {
            attempt.distance_from_last = distance;
            if distance > FAR_DISTANCE_KM {
                assessment.add(FAR_DISTANCE_POINTS, Some("Unusual location detected"));
            } else if distance > MODERATE_DISTANCE_KM {
                assessment.add(MODERATE_DISTANCE_POINTS, None);
            }
        }

        if attempt.replays_otp_of(last) {
            attempt.otp_replay_detected = true;
            assessment.add(OTP_REPLAY_POINTS, Some("OTP replay detected"));
        }

        if !stats.is_empty() && attempt.device_id != stats.most_common_device {
            attempt.device_mismatch = true;
            assessment.add(DEVICE_MISMATCH_POINTS, Some("Login from a new device"));
        }

        if stats.avg_login_interval > 0.0 && stats.std_dev_interval > 0.0 {
            let since_last = attempt.seconds_since(last);
            let z = (since_last - stats.avg_login_interval) / stats.std_dev_interval;
            if z.abs() > TIMING_Z_THRESHOLD {
                log::debug!(
                    "Timing anomaly for {}: {:.0}s since last login, z = {:.2}",
                    attempt.user_id,
                    since_last,
                    z
                );
                assessment.add(TIMING_ANOMALY_POINTS, Some("Unusual login time detected"));
            }
        }

        Ok(assessment)
    }

    /// Distance between the two labels, `None` when the lookup was skipped
    async fn distance(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, DetectionError> {
        if from == to {
            return Ok(Some(0.0));
        }

        match guarded_lookup(cancel, self.timeout, self.resolver.distance_km(from, to, cancel)).await {
            Ok(distance) => Ok(Some(distance)),
            Err(LookupError::Cancelled) => Err(DetectionError::Cancelled),
            Err(e) if self.policy.geo_fails_fast() => Err(e.into()),
            Err(e) => {
                log::warn!("Skipping geo distance rule ({} -> {}): {}", from, to, e);
                Ok(None)
            }
        }
    }
}
