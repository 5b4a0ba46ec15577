#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alertd::alerter::{DeliveryChannel, DeliveryError};
use alertd::config::{DeliveryConfig, StorageConfig};
use alertd::storage::Storage;
use alertd::types::{AlertNotification, ChannelKind, MetricDefinition, MetricKind};
use alertd::{Engine, EngineBuilder};

/// In-memory delivery channel recording every message it accepts.
pub struct RecordingChannel {
    kind: ChannelKind,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Self::build(kind, 0, None)
    }

    /// Fails the first `n` attempts, then succeeds.
    pub fn failing(kind: ChannelKind, n: usize) -> Arc<Self> {
        Self::build(kind, n, None)
    }

    pub fn slow(kind: ChannelKind, delay: Duration) -> Arc<Self> {
        Self::build(kind, 0, Some(delay))
    }

    fn build(kind: ChannelKind, failures: usize, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            failures_left: AtomicUsize::new(failures),
            delay,
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, notification: &AlertNotification) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DeliveryError::Other("connection refused".into()));
        }
        self.sent.lock().push((
            notification.recipient.clone(),
            notification.subject.clone(),
            notification.message.clone(),
        ));
        Ok(())
    }
}

/// Retries immediately, at most three times, one second timeout.
pub fn fast_delivery() -> DeliveryConfig {
    DeliveryConfig {
        timeout_secs: 1,
        max_retries: 3,
        unbounded_retries: false,
        backoff_base_secs: 0,
        backoff_max_secs: 0,
    }
}

pub fn storage() -> Storage {
    Storage::new(&StorageConfig::default())
}

pub fn builder_with(channels: &[Arc<RecordingChannel>]) -> EngineBuilder {
    let mut builder = EngineBuilder::new(storage()).hostname("test-host").delivery(fast_delivery());
    for channel in channels {
        builder = builder.channel(channel.clone());
    }
    builder
}

pub fn engine_with(channels: &[Arc<RecordingChannel>]) -> Engine {
    builder_with(channels).build()
}

pub fn gauge(engine: &Engine, name: &str) {
    engine
        .storage
        .register_metric(MetricDefinition::new(name, MetricKind::Gauge))
        .unwrap();
}
