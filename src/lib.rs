pub mod alerting;
pub mod config;
pub mod deadline;
pub mod detection;
pub mod error;
pub mod geolocation;
pub mod input;
pub mod intake;
pub mod models;
pub mod output;
pub mod persistence;
pub mod reputation;
pub mod tasks;

// Re-export commonly used types
pub use alerting::{AlertDispatcher, AlertQueue, PhishingAlert};
pub use config::{Config, LookupFailurePolicy};
pub use detection::{BaselineCalculator, DetectionOrchestrator, NetworkSignalAggregator, RiskScorer};
pub use error::{DetectionError, LookupError};
pub use geolocation::{GeoDistanceEstimator, GeoIpService};
pub use intake::{DetectionResponse, FailureResponse, LoginIntake};
pub use models::{BehavioralStats, LoginAttempt, LoginRequest, NetworkAnalysisResult};
pub use persistence::{CachedHistoryStore, SqliteLoginStore};
pub use tasks::BackgroundTasks;
