//! Best-effort real-time broadcast of metric updates and alert lifecycle
//! events to live dashboard consumers.
//!
//! Publishing never fails towards the caller: transport problems are
//! logged and dropped.

#[cfg(feature = "nats")]
pub mod nats;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::types::{AlertInstance, AlertPayload, Labels, MetricValue};

/// Publish/subscribe topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Updates of a single metric, `metrics.<name>`.
    Metric(String),
    /// Every metric update, `metrics.all`.
    AllMetrics,
    /// Alert lifecycle transitions.
    Alerts,
}

impl Topic {
    pub fn subject(&self) -> String {
        match self {
            Topic::Metric(name) => format!("metrics.{}", name),
            Topic::AllMetrics => "metrics.all".to_string(),
            Topic::Alerts => "alerts".to_string(),
        }
    }
}

/// A broadcast transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Deliver `payload` on `topic`. Must not panic or block for long.
    async fn publish(&self, topic: &Topic, payload: &serde_json::Value);
}

/// Payload published for each ingested sample
#[derive(Debug, Clone, Serialize)]
pub struct MetricUpdate {
    pub metric: String,
    pub value: f64,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
}

impl From<&MetricValue> for MetricUpdate {
    fn from(sample: &MetricValue) -> Self {
        Self {
            metric: sample.metric.clone(),
            value: sample.value,
            labels: sample.labels.clone(),
            timestamp: sample.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEventKind {
    Triggered,
    Acknowledged,
    Resolved,
}

/// Payload published on the alerts topic
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub event: AlertEventKind,
    pub at: DateTime<Utc>,
    pub alert: AlertPayload,
}

/// Publish a metric sample on its own topic and on the aggregate stream.
pub async fn publish_metric(publisher: &dyn Publisher, sample: &MetricValue) {
    let payload = match serde_json::to_value(MetricUpdate::from(sample)) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, metric = %sample.metric, "Failed to serialize metric update");
            return;
        }
    };
    publisher.publish(&Topic::Metric(sample.metric.clone()), &payload).await;
    publisher.publish(&Topic::AllMetrics, &payload).await;
}

/// Publish an alert lifecycle transition.
pub async fn publish_alert(
    publisher: &dyn Publisher,
    event: AlertEventKind,
    instance: &AlertInstance,
    hostname: &str,
) {
    let event = AlertEvent {
        event,
        at: Utc::now(),
        alert: AlertPayload::new(instance, hostname),
    };
    match serde_json::to_value(&event) {
        Ok(payload) => publisher.publish(&Topic::Alerts, &payload).await,
        Err(e) => warn!(error = %e, instance_id = instance.id, "Failed to serialize alert event"),
    }
}

/// A message as seen by in-process subscribers
#[derive(Debug, Clone)]
pub struct Published {
    pub subject: String,
    pub payload: serde_json::Value,
}

/// In-process publisher backed by a tokio broadcast channel.
///
/// Slow subscribers lose the oldest messages; having no subscribers at
/// all is normal.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Published>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    fn name(&self) -> &str { "broadcast" }

    async fn publish(&self, topic: &Topic, payload: &serde_json::Value) {
        let message = Published { subject: topic.subject(), payload: payload.clone() };
        if self.tx.send(message).is_err() {
            trace!(subject = %topic.subject(), "No live subscribers");
        }
    }
}

/// Forwards every message to each inner publisher in turn.
pub struct FanoutPublisher {
    sinks: Vec<Arc<dyn Publisher>>,
}

impl FanoutPublisher {
    pub fn new(sinks: Vec<Arc<dyn Publisher>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Publisher for FanoutPublisher {
    fn name(&self) -> &str { "fanout" }

    async fn publish(&self, topic: &Topic, payload: &serde_json::Value) {
        for sink in &self.sinks {
            sink.publish(topic, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use smallvec::smallvec;

    use crate::types::Label;

    #[test]
    fn topic_subjects() {
        assert_eq!(Topic::Metric("cpu.load".into()).subject(), "metrics.cpu.load");
        assert_eq!(Topic::AllMetrics.subject(), "metrics.all");
        assert_eq!(Topic::Alerts.subject(), "alerts");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish(&Topic::Alerts, &serde_json::json!({"x": 1})).await;
    }

    #[tokio::test]
    async fn metric_updates_reach_both_topics() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();
        let sample = MetricValue {
            id: 1,
            metric: "cpu.load".into(),
            value: 42.0,
            labels: smallvec![Label::new("host", "a")],
            timestamp: Utc::now(),
            summary: None,
        };

        publish_metric(&publisher, &sample).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.subject, "metrics.cpu.load");
        assert_eq!(second.subject, "metrics.all");
        assert_eq!(first.payload["value"], 42.0);
        assert_eq!(first.payload["labels"][0]["key"], "host");
    }

    #[tokio::test]
    async fn fanout_forwards_to_every_sink() {
        let a = BroadcastPublisher::new(4);
        let b = BroadcastPublisher::new(4);
        let (mut ra, mut rb) = (a.subscribe(), b.subscribe());
        let fanout = FanoutPublisher::new(vec![Arc::new(a), Arc::new(b)]);

        fanout.publish(&Topic::Alerts, &serde_json::json!({})).await;

        assert_eq!(ra.recv().await.unwrap().subject, "alerts");
        assert_eq!(rb.recv().await.unwrap().subject, "alerts");
    }
}
