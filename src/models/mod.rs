pub mod attempt;
pub mod signals;

pub use attempt::{LoginAttempt, LoginRequest};
pub use signals::{BehavioralStats, IpReputation, NetworkAnalysisResult};
