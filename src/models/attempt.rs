use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DetectionError;

/// An authentication event as submitted by the login front end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
    pub ip_address: String,
    pub device_id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub otp_code_hash: String,
    #[serde(default)]
    pub success: bool,
    /// Event time; replayed feeds carry one, live traffic is stamped on intake
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LoginRequest {
    /// Reject requests that lack the identity fields detection keys on
    pub fn validate(&self) -> Result<(), DetectionError> {
        if self.user_id.trim().is_empty() {
            return Err(DetectionError::Validation("user ID cannot be empty".to_string()));
        }
        if self.ip_address.trim().is_empty() {
            return Err(DetectionError::Validation("IP address cannot be empty".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(DetectionError::Validation("device ID cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Validate and turn the request into an attempt record stamped at `now`
    /// unless the request carries its own timestamp
    pub fn into_attempt(self, now: DateTime<Utc>) -> Result<LoginAttempt, DetectionError> {
        self.validate()?;
        Ok(LoginAttempt {
            id: None,
            user_id: self.user_id,
            ip_address: self.ip_address,
            device_id: self.device_id,
            location: self.location,
            user_agent: self.user_agent,
            otp_code_hash: self.otp_code_hash,
            success: self.success,
            distance_from_last: 0.0,
            risk_score: 0,
            device_mismatch: false,
            otp_replay_detected: false,
            login_frequency_high: false,
            multiple_ips_detected: false,
            is_phishing_risk: false,
            created_at: self.timestamp.unwrap_or(now),
        })
    }
}

/// One login attempt enriched with the risk signals derived during detection
///
/// The derived fields are filled in by the detection pipeline before the
/// single write to the attempt store. Stored attempts are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub id: Option<i64>,
    pub user_id: String,
    pub ip_address: String,
    pub device_id: String,
    pub location: String,
    pub user_agent: String,
    #[serde(skip_serializing, default)]
    pub otp_code_hash: String,
    pub success: bool,

    pub distance_from_last: f64,
    pub risk_score: u32,
    pub device_mismatch: bool,
    pub otp_replay_detected: bool,
    pub login_frequency_high: bool,
    pub multiple_ips_detected: bool,
    pub is_phishing_risk: bool,
    pub created_at: DateTime<Utc>,
}

impl LoginAttempt {
    /// Seconds elapsed between `earlier` and this attempt
    pub fn seconds_since(&self, earlier: &LoginAttempt) -> f64 {
        (self.created_at - earlier.created_at).num_milliseconds() as f64 / 1000.0
    }

    /// Whether this attempt reuses `other`'s OTP hash
    pub fn replays_otp_of(&self, other: &LoginAttempt) -> bool {
        !self.otp_code_hash.is_empty() && self.otp_code_hash == other.otp_code_hash
    }
}
