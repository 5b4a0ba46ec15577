use anyhow::Result;
use async_nats::Client;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Publisher, Topic};
use crate::config::NatsConfig;

/// Publishes JSON payloads to NATS subjects `<prefix>.<topic>`.
pub struct NatsPublisher {
    client: Client,
    config: NatsConfig,
}

impl NatsPublisher {
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = if let Some(ref cred) = config.credential_file {
            async_nats::ConnectOptions::with_credentials_file(std::path::PathBuf::from(cred))
                .await?
                .connect(&config.url)
                .await?
        } else if let Some(ref token) = config.token {
            async_nats::ConnectOptions::with_token(token.clone())
                .connect(&config.url)
                .await?
        } else {
            async_nats::connect(&config.url).await?
        };

        info!(url = %config.url, prefix = %config.subject_prefix, "NATS publisher connected");

        Ok(Self { client, config })
    }

    fn subject(&self, topic: &Topic) -> String {
        format!("{}.{}", self.config.subject_prefix, topic.subject())
    }

    fn maybe_compress(&self, data: Vec<u8>) -> Vec<u8> {
        if !self.config.compression {
            return data;
        }
        match zstd::encode_all(data.as_slice(), 3) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!(error = %e, "zstd compression failed, sending uncompressed");
                data
            }
        }
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    fn name(&self) -> &str { "nats" }

    async fn publish(&self, topic: &Topic, payload: &serde_json::Value) {
        let json = match serde_json::to_vec(payload) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize payload");
                return;
            }
        };

        let data = self.maybe_compress(json);
        let subject = self.subject(topic);
        if let Err(e) = self.client.publish(subject.clone(), data.into()).await {
            warn!(error = %e, subject = %subject, "Failed to publish to NATS");
        } else {
            debug!(subject = %subject, "Published");
        }
    }
}
