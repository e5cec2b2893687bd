pub mod baseline;
pub mod network;
pub mod orchestrator;
pub mod scorer;

pub use baseline::BaselineCalculator;
pub use network::{NetworkAssessment, NetworkSignalAggregator};
pub use orchestrator::{DetectionOrchestrator, DetectionOutcome};
pub use scorer::{RiskScorer, RuleAssessment};
