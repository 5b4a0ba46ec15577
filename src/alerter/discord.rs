use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{DeliveryChannel, DeliveryError};
use crate::config::DiscordConfig;
use crate::types::{AlertNotification, ChannelKind, Severity};

/// Discord webhook channel; the recipient is the webhook URL
pub struct DiscordChannel {
    username: String,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        Ok(Self {
            username: config.username.clone().unwrap_or_else(|| "alertd".into()),
            client: reqwest::Client::new(),
        })
    }

    fn severity_color(severity: Severity) -> u32 {
        match severity {
            Severity::Emergency => 0x9B59B6, // purple
            Severity::Critical => 0xE74C3C,  // red
            Severity::Warn => 0xF39C12,      // yellow
            Severity::Info => 0x2ECC71,      // green
        }
    }
}

#[async_trait]
impl DeliveryChannel for DiscordChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Discord }

    async fn send(&self, notification: &AlertNotification) -> Result<(), DeliveryError> {
        let payload = json!({
            "username": self.username,
            "embeds": [{
                "title": notification.subject,
                "description": notification.message,
                "color": Self::severity_color(notification.severity),
            }]
        });

        self.client.post(&notification.recipient)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}
