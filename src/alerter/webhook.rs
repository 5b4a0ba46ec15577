use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use super::{DeliveryChannel, DeliveryError};
use crate::config::WebhookConfig;
use crate::types::{AlertNotification, ChannelKind};

/// Generic HTTP webhook channel; the recipient is the target URL
pub struct WebhookChannel {
    method: reqwest::Method,
    headers: std::collections::HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let method = reqwest::Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("Invalid webhook method: {}", config.method))?;

        Ok(Self {
            method,
            headers: config.headers.clone(),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Webhook }

    async fn send(&self, notification: &AlertNotification) -> Result<(), DeliveryError> {
        let payload = json!({
            "subject": notification.subject,
            "message": notification.message,
            "severity": notification.severity,
        });

        let mut req = self.client.request(self.method.clone(), &notification.recipient).json(&payload);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        req.send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_method() {
        let config = WebhookConfig { method: "NOT A METHOD".into(), ..WebhookConfig::default() };
        assert!(WebhookChannel::new(&config).is_err());
        let config = WebhookConfig { method: "put".into(), ..WebhookConfig::default() };
        assert_eq!(WebhookChannel::new(&config).unwrap().method, reqwest::Method::PUT);
    }
}
