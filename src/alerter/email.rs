use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{DeliveryChannel, DeliveryError};
use crate::config::EmailConfig;
use crate::types::{AlertNotification, ChannelKind};

/// SMTP email channel; the recipient is an email address
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let builder = if config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .with_context(|| format!("Invalid SMTP relay: {}", config.smtp_host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        let mut builder = builder.port(config.smtp_port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = config
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("Invalid sender address: {}", config.from))?;

        Ok(Self { transport: builder.build(), from })
    }
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Email }

    async fn send(&self, notification: &AlertNotification) -> Result<(), DeliveryError> {
        let recipient = &notification.recipient;
        let to = recipient
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError::Address(format!("{recipient}: {e}")))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notification.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.message.clone())
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NotificationStatus, Severity};
    use chrono::Utc;

    fn config(from: &str) -> EmailConfig {
        EmailConfig {
            enabled: true,
            smtp_host: "localhost".into(),
            smtp_port: 2525,
            smtp_tls: false,
            username: None,
            password: None,
            from: from.into(),
        }
    }

    #[test]
    fn rejects_bad_sender() {
        assert!(EmailChannel::new(&config("not an address")).is_err());
    }

    #[tokio::test]
    async fn rejects_bad_recipient_before_connecting() {
        let channel = EmailChannel::new(&config("alertd@example.com")).unwrap();
        let notification = AlertNotification {
            id: 1,
            instance_id: 1,
            channel: ChannelKind::Email,
            severity: Severity::Warn,
            recipient: "nobody".into(),
            subject: "s".into(),
            message: "m".into(),
            status: NotificationStatus::Pending,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            error_message: None,
            retry_count: 0,
            next_attempt_at: None,
        };
        let err = channel.send(&notification).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Address(_)));
    }
}
