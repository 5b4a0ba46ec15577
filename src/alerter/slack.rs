use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{DeliveryChannel, DeliveryError};
use crate::config::SlackConfig;
use crate::types::{AlertNotification, ChannelKind};

/// Slack incoming-webhook channel.
///
/// The recipient is either a webhook URL or a channel name (`#ops`), in
/// which case the configured default webhook is used.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(config: &SlackConfig) -> Result<Self> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            client: reqwest::Client::new(),
        })
    }

    fn target<'a>(&'a self, recipient: &'a str) -> Result<(&'a str, Option<&'a str>), DeliveryError> {
        if recipient.starts_with("http://") || recipient.starts_with("https://") {
            return Ok((recipient, None));
        }
        match self.webhook_url.as_deref() {
            Some(url) => Ok((url, Some(recipient))),
            None => Err(DeliveryError::Address(format!(
                "slack recipient '{recipient}' is not a URL and no default webhook is configured"
            ))),
        }
    }
}

#[async_trait]
impl DeliveryChannel for SlackChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Slack }

    async fn send(&self, notification: &AlertNotification) -> Result<(), DeliveryError> {
        let (url, channel) = self.target(&notification.recipient)?;

        let mut payload = json!({
            "text": notification.subject,
            "attachments": [{
                "title": notification.subject,
                "text": notification.message,
            }]
        });

        if let Some(ch) = channel {
            payload["channel"] = json!(ch);
        }

        self.client.post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}
