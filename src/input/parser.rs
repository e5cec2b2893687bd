use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

use crate::models::LoginRequest;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON attempt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Malformed attempt line: {0}")]
    Malformed(String),
}

/// Parses one line of an attempt feed into a [`LoginRequest`]
///
/// Two formats are accepted: a JSON object per line, or `key=value`
/// pairs (values may be double-quoted), for example
///
/// ```text
/// user=alice ip=203.0.113.7 device=laptop-1 location="New York" otp=9f86d0 success=true
/// ```
pub struct AttemptParser {
    pair: Regex,
}

impl AttemptParser {
    pub fn new() -> Result<Self, FeedError> {
        Ok(AttemptParser {
            pair: Regex::new(r#"(\w+)=(?:"([^"]*)"|(\S+))"#)?,
        })
    }

    /// Parse a line; blank lines and `#` comments yield `None`
    pub fn parse_line(&self, line: &str) -> Result<Option<LoginRequest>, FeedError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        if line.starts_with('{') {
            return Ok(Some(serde_json::from_str(line)?));
        }
        self.parse_pairs(line).map(Some)
    }

    fn parse_pairs(&self, line: &str) -> Result<LoginRequest, FeedError> {
        let mut request = LoginRequest::default();
        let mut matched = false;

        for cap in self.pair.captures_iter(line) {
            matched = true;
            let key = &cap[1];
            let value = cap
                .get(2)
                .or_else(|| cap.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            match key {
                "user" | "user_id" => request.user_id = value,
                "ip" | "ip_address" => request.ip_address = value,
                "device" | "device_id" => request.device_id = value,
                "location" => request.location = value,
                "user_agent" | "ua" => request.user_agent = value,
                "otp" | "otp_code_hash" => request.otp_code_hash = value,
                "success" => {
                    request.success = value
                        .parse()
                        .map_err(|_| FeedError::Malformed(format!("success={}", value)))?
                }
                "timestamp" | "ts" => request.timestamp = Some(parse_timestamp(&value)?),
                other => log::debug!("Ignoring unknown attempt field '{}'", other),
            }
        }

        if !matched {
            return Err(FeedError::Malformed(line.to_string()));
        }
        Ok(request)
    }
}

/// RFC 3339 or Unix seconds
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, FeedError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| FeedError::Malformed(format!("timestamp={}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value_line() {
        let parser = AttemptParser::new().unwrap();
        let line = r#"user=alice ip=203.0.113.7 device=laptop-1 location="New York" otp=9f86d0 success=true ts=1709294400"#;

        let request = parser.parse_line(line).unwrap().unwrap();

        assert_eq!(request.user_id, "alice");
        assert_eq!(request.ip_address, "203.0.113.7");
        assert_eq!(request.device_id, "laptop-1");
        assert_eq!(request.location, "New York");
        assert_eq!(request.otp_code_hash, "9f86d0");
        assert!(request.success);
        assert_eq!(
            request.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_json_line() {
        let parser = AttemptParser::new().unwrap();
        let line = r#"{"user_id":"bob","ip_address":"198.51.100.4","device_id":"phone","timestamp":"2024-03-01T12:00:00Z"}"#;

        let request = parser.parse_line(line).unwrap().unwrap();

        assert_eq!(request.user_id, "bob");
        assert_eq!(request.location, "");
        assert!(!request.success);
        assert!(request.timestamp.is_some());
    }

    #[test]
    fn test_skips_blank_and_comment_lines() {
        let parser = AttemptParser::new().unwrap();
        assert!(parser.parse_line("   ").unwrap().is_none());
        assert!(parser.parse_line("# replayed from staging").unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines() {
        let parser = AttemptParser::new().unwrap();
        assert!(matches!(parser.parse_line("just some text"), Err(FeedError::Malformed(_))));
        assert!(matches!(parser.parse_line("user=a success=maybe"), Err(FeedError::Malformed(_))));
        assert!(matches!(parser.parse_line("{not json"), Err(FeedError::Json(_))));
    }
}
