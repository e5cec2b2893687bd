//! Error taxonomy for the detection pipeline
//!
//! Collaborator failures (geocoding, GeoIP, reputation) are reported as
//! [`LookupError`]. Everything that can abort a detection run is folded
//! into [`DetectionError`], which is what callers of the orchestrator see.

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Errors raised by external lookup collaborators
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GeoIP database error: {0}")]
    GeoIpDatabase(#[from] maxminddb::MaxMindDBError),

    #[error("Database file not found: {0}")]
    FileNotFound(String),

    #[error("No result for '{0}'")]
    NotFound(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Lookup cancelled")]
    Cancelled,

    #[error("Lookup timed out")]
    TimedOut,
}

/// Errors that abort a detection run
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Invalid login attempt: {0}")]
    Validation(String),

    #[error("Lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Detection cancelled")]
    Cancelled,

    #[error("Detection timed out")]
    TimedOut,

    #[error("Internal fault: {0}")]
    Internal(String),
}

impl DetectionError {
    /// Message safe to hand back to the client that submitted the attempt
    pub fn public_message(&self) -> &'static str {
        match self {
            DetectionError::Validation(_) => "Invalid login attempt",
            _ => "Login attempt could not be processed",
        }
    }

    /// Whether the failure was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(self, DetectionError::Validation(_))
    }

    /// Fold cancellation reported by a collaborator into `Cancelled`
    pub fn normalized(self) -> Self {
        match self {
            DetectionError::Lookup(LookupError::Cancelled)
            | DetectionError::Persistence(PersistenceError::Cancelled) => DetectionError::Cancelled,
            other => other,
        }
    }
}
