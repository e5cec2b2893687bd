//! Alerting module for phishing-risk notifications
//!
//! Escalated attempts are queued on a bounded channel and delivered by an
//! [`AlertDispatcher`] task to every configured notification channel
//! (Slack, Discord, generic webhooks). Delivery is best-effort: failures
//! are logged and never reach the detection pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AlertConfig;
use crate::models::LoginAttempt;

/// Errors that can occur during alert dispatch
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown alert channel: {0}")]
    UnknownChannel(String),

    #[error("Channel {channel} returned status {status}")]
    Rejected { channel: String, status: u16 },

    #[error("Alert channel closed")]
    ChannelClosed,

    #[error("Alert queue full")]
    QueueFull,
}

/// An escalated login attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhishingAlert {
    pub user_id: String,
    pub ip_address: String,
    pub device_id: String,
    pub location: String,
    pub risk_score: u32,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl PhishingAlert {
    pub fn new(attempt: &LoginAttempt, reasons: &[String]) -> Self {
        PhishingAlert {
            user_id: attempt.user_id.clone(),
            ip_address: attempt.ip_address.clone(),
            device_id: attempt.device_id.clone(),
            location: attempt.location.clone(),
            risk_score: attempt.risk_score,
            reasons: reasons.to_vec(),
            created_at: attempt.created_at,
        }
    }

    /// Human-readable alert text
    pub fn message(&self) -> String {
        format!(
            "Phishing alert! User: {}, IP: {}, Device: {}, Location: {}.\nRisk score: {}\nIssues: {}",
            self.user_id,
            self.ip_address,
            self.device_id,
            if self.location.is_empty() { "unknown" } else { &self.location },
            self.risk_score,
            if self.reasons.is_empty() {
                "none recorded".to_string()
            } else {
                self.reasons.join("; ")
            }
        )
    }
}

/// Delivers a message to a named channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &str, message: &str) -> Result<(), AlertError>;
}

/// [`Notifier`] posting to the webhooks in an [`AlertConfig`]
///
/// Channel names are `slack`, `discord`, or the `name` of a generic webhook.
pub struct WebhookNotifier {
    config: AlertConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: AlertConfig) -> Self {
        WebhookNotifier {
            config,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Names of every configured channel
    pub fn channels(&self) -> Vec<String> {
        let mut channels = Vec::new();
        if self.config.slack.is_some() {
            channels.push("slack".to_string());
        }
        if self.config.discord.is_some() {
            channels.push("discord".to_string());
        }
        channels.extend(self.config.webhooks.iter().map(|w| w.name.clone()));
        channels
    }

    async fn post(
        &self,
        channel: &str,
        request: reqwest::RequestBuilder,
        payload: &serde_json::Value,
    ) -> Result<(), AlertError> {
        let response = request.json(payload).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Rejected {
                channel: channel.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, channel: &str, message: &str) -> Result<(), AlertError> {
        match channel {
            "slack" => {
                let slack = self
                    .config
                    .slack
                    .as_ref()
                    .ok_or_else(|| AlertError::UnknownChannel(channel.to_string()))?;
                let payload = serde_json::json!({
                    "channel": slack.channel,
                    "username": slack.username.as_deref().unwrap_or("otpguard"),
                    "icon_emoji": ":shield:",
                    "text": message,
                });
                self.post(channel, self.client.post(&slack.webhook_url), &payload).await
            }
            "discord" => {
                let discord = self
                    .config
                    .discord
                    .as_ref()
                    .ok_or_else(|| AlertError::UnknownChannel(channel.to_string()))?;
                let payload = serde_json::json!({
                    "username": discord.username.as_deref().unwrap_or("otpguard"),
                    "content": message,
                });
                self.post(channel, self.client.post(&discord.webhook_url), &payload).await
            }
            name => {
                let webhook = self
                    .config
                    .webhooks
                    .iter()
                    .find(|w| w.name == name)
                    .ok_or_else(|| AlertError::UnknownChannel(name.to_string()))?;

                let method = webhook.method.as_deref().unwrap_or("POST");
                let mut request = match method.to_uppercase().as_str() {
                    "PUT" => self.client.put(&webhook.url),
                    _ => self.client.post(&webhook.url),
                };
                if let Some(ref headers) = webhook.headers {
                    for (key, value) in headers {
                        request = request.header(key, value);
                    }
                }
                let payload = serde_json::json!({ "channel": name, "message": message });
                self.post(channel, request, &payload).await
            }
        }
    }
}

/// Async alert dispatcher
///
/// Runs as a tokio task, receiving alerts from the queue and sending
/// each one to all configured channels.
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    channels: Vec<String>,
    enabled: bool,
}

impl AlertDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, channels: Vec<String>, enabled: bool) -> Self {
        AlertDispatcher {
            notifier,
            channels,
            enabled,
        }
    }

    /// Dispatcher for the webhooks in `config`
    pub fn from_config(config: &AlertConfig) -> Self {
        let notifier = WebhookNotifier::new(config.clone());
        let channels = notifier.channels();
        if config.enabled && channels.is_empty() {
            log::warn!("Alerting enabled but no channels configured");
        }
        AlertDispatcher::new(Arc::new(notifier), channels, config.enabled)
    }

    /// Create a bounded channel for queueing alerts
    pub fn create_channel(capacity: usize) -> (mpsc::Sender<PhishingAlert>, mpsc::Receiver<PhishingAlert>) {
        mpsc::channel(capacity.max(1))
    }

    /// Run the alert dispatch loop until every queue handle is dropped
    pub async fn run(self, mut rx: mpsc::Receiver<PhishingAlert>) {
        log::info!("Alert dispatcher started ({} channel(s))", self.channels.len());

        while let Some(alert) = rx.recv().await {
            if !self.enabled {
                log::debug!("Alerting disabled, dropping alert for user {}", alert.user_id);
                continue;
            }

            log::info!(
                "Dispatching phishing alert for user {} (score {})",
                alert.user_id,
                alert.risk_score
            );
            let failures = self.dispatch(&alert).await;
            if failures > 0 {
                log::warn!(
                    "{} of {} alert channel(s) failed for user {}",
                    failures,
                    self.channels.len(),
                    alert.user_id
                );
            }
        }

        log::info!("Alert dispatcher stopped");
    }

    /// Send an alert to every channel, returning the number of failures
    pub async fn dispatch(&self, alert: &PhishingAlert) -> usize {
        let message = alert.message();
        let mut failures = 0;
        for channel in &self.channels {
            if let Err(e) = self.notifier.send(channel, &message).await {
                log::error!("Alert channel {} failed: {}", channel, e);
                failures += 1;
            }
        }
        failures
    }
}

/// Cloneable handle for queueing alerts without blocking detection
#[derive(Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<PhishingAlert>,
}

impl AlertQueue {
    pub fn new(tx: mpsc::Sender<PhishingAlert>) -> Self {
        AlertQueue { tx }
    }

    /// Queue an alert for dispatch (non-blocking)
    ///
    /// If the queue is full or closed the alert is dropped and the
    /// reason returned to the caller for logging.
    pub fn queue_alert(&self, alert: PhishingAlert) -> Result<(), AlertError> {
        self.tx.try_send(alert).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AlertError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AlertError::ChannelClosed,
        })
    }
}
