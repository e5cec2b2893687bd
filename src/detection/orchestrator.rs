//! Detection pipeline for a single login attempt
//!
//! `Start -> HistoryFetched -> Scored(rules) -> Scored(network) -> Decided
//! -> Persisted -> (AlertDispatched)`
//!
//! Everything up to and including the write happens inside one
//! [`AttemptTransaction`]. Any failure, including a panic inside a rule or
//! collaborator, rolls that transaction back so no attempt is ever
//! partially recorded. The cache refresh and the alert run after the
//! commit and cannot undo it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::baseline::BaselineCalculator;
use super::network::NetworkSignalAggregator;
use super::scorer::RiskScorer;
use crate::alerting::{AlertQueue, PhishingAlert};
use crate::config::DetectionConfig;
use crate::deadline::guarded;
use crate::error::DetectionError;
use crate::models::{LoginAttempt, NetworkAnalysisResult};
use crate::persistence::{AttemptStore, AttemptTransaction, HistoryStore};
use crate::tasks::BackgroundTasks;

/// Result of a completed detection run
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    /// The attempt as persisted, with its row id
    pub attempt: LoginAttempt,
    /// Rule reasons followed by network reasons
    pub reasons: Vec<String>,
    pub network: NetworkAnalysisResult,
}

pub struct DetectionOrchestrator {
    store: Arc<dyn AttemptStore>,
    history: Arc<dyn HistoryStore>,
    scorer: RiskScorer,
    network: NetworkSignalAggregator,
    alerts: Option<AlertQueue>,
    tasks: BackgroundTasks,
    phishing_threshold: u32,
    history_limit: usize,
    timeout: Duration,
}

impl DetectionOrchestrator {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        history: Arc<dyn HistoryStore>,
        scorer: RiskScorer,
        network: NetworkSignalAggregator,
        tasks: BackgroundTasks,
        config: &DetectionConfig,
    ) -> Self {
        DetectionOrchestrator {
            store,
            history,
            scorer,
            network,
            alerts: None,
            tasks,
            phishing_threshold: config.phishing_threshold,
            history_limit: config.history_limit,
            timeout: config.collaborator_timeout(),
        }
    }

    /// Queue escalations on `queue`
    pub fn with_alerts(mut self, queue: AlertQueue) -> Self {
        self.alerts = Some(queue);
        self
    }

    /// Score, decide and persist one attempt
    pub async fn detect(
        &self,
        attempt: LoginAttempt,
        cancel: &CancellationToken,
    ) -> Result<DetectionOutcome, DetectionError> {
        let user_id = attempt.user_id.clone();
        let mut tx = self.store.begin().await?;

        let evaluated = AssertUnwindSafe(self.evaluate(tx.as_mut(), attempt, cancel))
            .catch_unwind()
            .await;

        let mut outcome = match evaluated {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tx.rollback().await;
                let e = e.normalized();
                log::error!("Detection for {} aborted: {}", user_id, e);
                return Err(e);
            }
            Err(panic) => {
                let detail = panic_detail(panic.as_ref());
                tx.rollback().await;
                log::error!("Detection for {} panicked: {}", user_id, detail);
                return Err(DetectionError::Internal(detail));
            }
        };

        let id = tx.commit().await.map_err(|e| {
            log::error!("Failed to persist attempt for {}: {}", user_id, e);
            DetectionError::from(e)
        })?;
        outcome.attempt.id = Some(id);

        self.after_commit(&outcome);
        Ok(outcome)
    }

    async fn evaluate(
        &self,
        tx: &mut dyn AttemptTransaction,
        mut attempt: LoginAttempt,
        cancel: &CancellationToken,
    ) -> Result<DetectionOutcome, DetectionError> {
        let history = guarded(
            cancel,
            self.timeout,
            tx.recent_attempts(&attempt.user_id, self.history_limit, attempt.created_at, cancel),
        )
        .await??;
        log::debug!("Fetched {} history records for {}", history.len(), attempt.user_id);

        let stats = BaselineCalculator::calculate(&history);
        let rules = self
            .scorer
            .score(&mut attempt, history.first(), &stats, cancel)
            .await?;
        let network = self.network.analyze(&attempt, cancel).await?;

        attempt.risk_score = rules.score + network.score;
        attempt.login_frequency_high = network.login_frequency_high;
        attempt.multiple_ips_detected = network.multiple_ips;
        attempt.is_phishing_risk = attempt.risk_score > self.phishing_threshold;

        tx.append(&attempt)?;

        let mut reasons = rules.reasons;
        reasons.extend(network.reasons);
        Ok(DetectionOutcome {
            attempt,
            reasons,
            network: network.analysis,
        })
    }

    fn after_commit(&self, outcome: &DetectionOutcome) {
        let attempt = &outcome.attempt;

        let history = self.history.clone();
        let (user_id, as_of) = (attempt.user_id.clone(), attempt.created_at);
        self.tasks.spawn("history cache refresh", async move {
            history.refresh(&user_id, as_of).await
        });

        if !attempt.is_phishing_risk {
            return;
        }

        log::warn!(
            "Phishing risk for user {} from {} (score {}): {}",
            attempt.user_id,
            attempt.ip_address,
            attempt.risk_score,
            outcome.reasons.join("; ")
        );
        match &self.alerts {
            Some(queue) => {
                if let Err(e) = queue.queue_alert(PhishingAlert::new(attempt, &outcome.reasons)) {
                    log::warn!("Failed to queue alert for {}: {}", attempt.user_id, e);
                }
            }
            None => log::debug!("No alert queue configured"),
        }
    }
}

fn panic_detail(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
