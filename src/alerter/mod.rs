pub mod discord;
pub mod email;
pub mod slack;
pub mod webhook;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ChannelsConfig, DeliveryConfig};
use crate::error::{EngineError, Result};
use crate::storage::Storage;
use crate::types::{
    AlertInstance, AlertNotification, AlertPayload, AlertRule, ChannelConfig, ChannelKind, NotificationId,
    NotificationStatus,
};

/// Slack on top of the delivery timeout before an unsettled claim lapses.
const CLAIM_GRACE: Duration = Duration::from_secs(5);

/// Why a single delivery attempt failed
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("no delivery channel configured for '{0}'")]
    NoChannel(ChannelKind),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("{0}")]
    Other(String),
}

/// Trait for alert delivery channels, one implementation per channel kind
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Channel kind this strategy serves
    fn kind(&self) -> ChannelKind;

    /// Deliver one notification to its recipient
    async fn send(&self, notification: &AlertNotification) -> std::result::Result<(), DeliveryError>;
}

/// External notification-preference policy (quiet hours, keyword
/// filters, per-user rate limits).
pub trait DeliveryPolicy: Send + Sync {
    fn should_deliver(&self, channel: &ChannelConfig, alert: &AlertPayload) -> bool;
}

/// How failed notifications are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: (!config.unbounded_retries).then_some(config.max_retries),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        }
    }

    /// Delay before the next attempt after `retry_count` failures:
    /// `base * 2^(retry_count - 1)`, capped at `backoff_max`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// A delay past the representable calendar means "never".
    fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        ChronoDuration::from_std(self.backoff(retry_count))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Outcome counters of one retry sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
}

/// Creates per-channel notification records for new alert instances and
/// drives their delivery.
pub struct NotificationDispatcher {
    storage: Storage,
    channels: HashMap<ChannelKind, Arc<dyn DeliveryChannel>>,
    policy: Option<Arc<dyn DeliveryPolicy>>,
    retry: RetryPolicy,
    timeout: Duration,
    hostname: String,
}

impl NotificationDispatcher {
    pub fn new(
        storage: Storage,
        channels: Vec<Arc<dyn DeliveryChannel>>,
        config: &DeliveryConfig,
        hostname: impl Into<String>,
    ) -> Self {
        let channels = channels.into_iter().map(|c| (c.kind(), c)).collect();
        Self {
            storage,
            channels,
            policy: None,
            retry: RetryPolicy::from_config(config),
            timeout: config.timeout(),
            hostname: hostname.into(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn DeliveryPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Create one `pending` notification per configured channel of `rule`,
    /// then try to deliver each of them immediately.
    pub async fn fan_out(&self, instance: &AlertInstance, rule: &AlertRule) -> Vec<AlertNotification> {
        let now = Utc::now();
        let subject = format!("[{}] {}", instance.severity, rule.name);

        let created: Vec<AlertNotification> = rule
            .channels
            .iter()
            .map(|channel| {
                self.storage.insert_notification(AlertNotification {
                    id: 0,
                    instance_id: instance.id,
                    channel: channel.kind,
                    severity: instance.severity,
                    recipient: channel.recipient.clone(),
                    subject: subject.clone(),
                    message: format_body(instance, &self.hostname),
                    status: NotificationStatus::Pending,
                    created_at: now,
                    sent_at: None,
                    delivered_at: None,
                    error_message: None,
                    retry_count: 0,
                    next_attempt_at: None,
                })
            })
            .collect();

        tracing::info!(
            instance_id = instance.id,
            rule = %rule.name,
            notifications = created.len(),
            "Fanned out alert notifications"
        );

        let mut results = Vec::with_capacity(created.len());
        for notification in created {
            match self.attempt_delivery(notification.id).await {
                Ok(n) => results.push(n),
                Err(e) => {
                    tracing::error!(notification_id = notification.id, error = %e, "Delivery attempt aborted");
                    results.push(notification);
                }
            }
        }
        results
    }

    /// Try to deliver one notification and record the outcome.
    ///
    /// The notification is claimed first, so an attempt already in flight
    /// or an already `sent` record is returned untouched instead of being
    /// delivered twice. A policy veto keeps the record `pending` until the
    /// next sweep. Channel failures are recorded on the notification, not
    /// returned. If the attempt is dropped mid-flight its claim lapses
    /// after the delivery timeout.
    pub async fn attempt_delivery(&self, id: NotificationId) -> Result<AlertNotification> {
        let now = Utc::now();
        let Some(notification) = self.storage.claim_notification(id, now, self.claim_until(now))? else {
            tracing::debug!(notification_id = id, "Notification already sent or in flight, skipping");
            return self.storage.notification(id).ok_or(EngineError::UnknownNotification(id));
        };

        let result = self.attempt_claimed(notification).await;
        if result.is_err() {
            self.storage.release_notification(id);
        }
        result
    }

    fn claim_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        ChronoDuration::from_std(self.timeout.saturating_add(CLAIM_GRACE))
            .ok()
            .and_then(|hold| now.checked_add_signed(hold))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn attempt_claimed(&self, notification: AlertNotification) -> Result<AlertNotification> {
        let id = notification.id;

        if let Some(policy) = &self.policy {
            let instance = self
                .storage
                .instance(notification.instance_id)
                .ok_or(EngineError::UnknownInstance(notification.instance_id))?;
            let payload = AlertPayload::new(&instance, &self.hostname);
            if !policy.should_deliver(&notification.channel_config(), &payload) {
                tracing::info!(
                    notification_id = id,
                    channel = %notification.channel,
                    "Delivery deferred by notification policy"
                );
                let next = self.retry.next_attempt_at(Utc::now(), 1);
                return self.storage.settle_notification(id, |n| {
                    n.status = NotificationStatus::Pending;
                    n.next_attempt_at = Some(next);
                });
            }
        }

        let outcome = self.deliver(&notification).await;
        let now = Utc::now();

        match outcome {
            Ok(()) => {
                tracing::info!(
                    notification_id = id,
                    channel = %notification.channel,
                    recipient = %notification.recipient,
                    "Notification sent"
                );
                self.storage.settle_notification(id, |n| {
                    n.status = NotificationStatus::Sent;
                    n.sent_at = Some(now);
                    n.delivered_at = Some(now);
                    n.error_message = None;
                    n.next_attempt_at = None;
                })
            }
            Err(e) => {
                let retry_count = notification.retry_count.saturating_add(1);
                let exhausted = self.retry.max_retries.is_some_and(|max| retry_count >= max);
                tracing::warn!(
                    notification_id = id,
                    channel = %notification.channel,
                    retry_count,
                    exhausted,
                    error = %e,
                    "Notification delivery failed"
                );
                let next = (!exhausted).then(|| self.retry.next_attempt_at(now, retry_count));
                self.storage.settle_notification(id, |n| {
                    n.status = NotificationStatus::Failed;
                    n.error_message = Some(e.to_string());
                    n.retry_count = retry_count;
                    n.next_attempt_at = next;
                })
            }
        }
    }

    async fn deliver(&self, notification: &AlertNotification) -> std::result::Result<(), DeliveryError> {
        let channel = self
            .channels
            .get(&notification.channel)
            .ok_or(DeliveryError::NoChannel(notification.channel))?;

        let send = channel.send(notification);
        match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.timeout)),
        }
    }

    /// Attempt up to `batch_size` due notifications, oldest first.
    pub async fn retry_sweep(&self, batch_size: usize) -> RetryReport {
        let due = self.storage.due_notifications(Utc::now(), batch_size, self.retry.max_retries);
        let mut report = RetryReport::default();

        for notification in due {
            report.attempted += 1;
            match self.attempt_delivery(notification.id).await {
                Ok(n) => match n.status {
                    NotificationStatus::Sent => report.sent += 1,
                    NotificationStatus::Failed => report.failed += 1,
                    NotificationStatus::Pending => report.deferred += 1,
                },
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(notification_id = notification.id, error = %e, "Retry attempt aborted");
                }
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                sent = report.sent,
                failed = report.failed,
                deferred = report.deferred,
                "Notification retry sweep finished"
            );
        }
        report
    }
}

fn format_body(instance: &AlertInstance, hostname: &str) -> String {
    let labels = instance
        .triggered_labels
        .iter()
        .map(|l| format!("{}={}", l.key, l.value))
        .collect::<Vec<_>>()
        .join(", ");
    let labels_line = if labels.is_empty() { String::new() } else { format!("\nLabels: {}", labels) };
    format!(
        "{message}\nSeverity: {severity}\nMetric: {metric}{labels_line}\nValue: {value:.2}\nHost: {hostname}\nTime: {time}",
        message = instance.message,
        severity = instance.severity,
        metric = instance.metric,
        labels_line = labels_line,
        value = instance.triggered_value,
        hostname = hostname,
        time = instance.triggered_at.to_rfc3339(),
    )
}

/// Create every enabled delivery channel from configuration
pub fn create_channels(config: &ChannelsConfig) -> AnyResult<Vec<Arc<dyn DeliveryChannel>>> {
    let mut channels: Vec<Arc<dyn DeliveryChannel>> = Vec::new();

    if let Some(ref ec) = config.email {
        if ec.enabled {
            channels.push(Arc::new(email::EmailChannel::new(ec)?));
        }
    }

    if config.slack.enabled {
        channels.push(Arc::new(slack::SlackChannel::new(&config.slack)?));
    }

    if config.discord.enabled {
        channels.push(Arc::new(discord::DiscordChannel::new(&config.discord)?));
    }

    if config.webhook.enabled {
        channels.push(Arc::new(webhook::WebhookChannel::new(&config.webhook)?));
    }

    tracing::info!(channels = channels.len(), "Initialized delivery channels");
    Ok(channels)
}
