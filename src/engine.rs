//! Wiring of the engine's components.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::alerter::{self, DeliveryChannel, DeliveryPolicy, NotificationDispatcher};
use crate::analyzer::AlertRuleEvaluator;
use crate::config::{Config, DeliveryConfig};
use crate::error::EngineError;
use crate::ingest::MetricIngestor;
use crate::lifecycle::AlertInstanceManager;
use crate::publisher::{BroadcastPublisher, FanoutPublisher, Published, Publisher};
use crate::storage::Storage;

/// A fully wired engine. Every component shares one [`Storage`].
pub struct Engine {
    pub storage: Storage,
    pub publisher: Arc<dyn Publisher>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub alerts: Arc<AlertInstanceManager>,
    pub evaluator: Arc<AlertRuleEvaluator>,
    pub ingestor: Arc<MetricIngestor>,
    live: BroadcastPublisher,
}

impl Engine {
    /// Build an engine from configuration: delivery channels from
    /// `[channels]`, publishers from `[publisher]` (and `[nats]`).
    pub async fn from_config(config: &Config) -> Result<Self> {
        let storage = Storage::new(&config.storage);

        let mut builder = EngineBuilder::new(storage)
            .hostname(config.engine.hostname.clone())
            .delivery(config.delivery.clone())
            .broadcast_capacity(config.publisher.broadcast_capacity);

        for channel in alerter::create_channels(&config.channels)? {
            builder = builder.channel(channel);
        }

        #[cfg(feature = "nats")]
        if config.nats.enabled {
            match crate::publisher::nats::NatsPublisher::connect(config.nats.clone()).await {
                Ok(nats) => builder = builder.sink(Arc::new(nats)),
                Err(e) => tracing::warn!(error = %e, "NATS unavailable, publishing in-process only"),
            }
        }

        Ok(builder.build())
    }

    /// Register the metric definitions and rules listed in configuration.
    ///
    /// Rules with an invalid condition are skipped with a warning: they
    /// are configuration errors and never fire.
    pub fn bootstrap(&self, config: &Config) -> Result<()> {
        for definition in &config.metrics {
            match self.storage.register_metric(definition.clone()) {
                Ok(_) => {}
                Err(EngineError::DuplicateMetric(name)) => {
                    self.storage.update_metric(definition.clone())?;
                    tracing::debug!(metric = %name, "Metric already registered, updated");
                }
                Err(e) => return Err(e.into()),
            }
        }

        for spec in &config.rules {
            match self.storage.create_rule(spec.clone()) {
                Ok(rule) => tracing::info!(rule = %rule.name, metric = %rule.metric, "Loaded alert rule"),
                Err(e @ EngineError::InvalidRuleCondition(_)) | Err(e @ EngineError::UnknownMetric(_)) => {
                    tracing::warn!(rule = %spec.name, error = %e, "Skipping misconfigured alert rule");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Subscribe to every message published in-process.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.live.subscribe()
    }
}

/// Assembles an [`Engine`] from parts; used by [`Engine::from_config`] and
/// by embedders that bring their own channels or policy.
pub struct EngineBuilder {
    storage: Storage,
    channels: Vec<Arc<dyn DeliveryChannel>>,
    policy: Option<Arc<dyn DeliveryPolicy>>,
    sinks: Vec<Arc<dyn Publisher>>,
    delivery: DeliveryConfig,
    hostname: String,
    broadcast_capacity: usize,
}

impl EngineBuilder {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            channels: Vec::new(),
            policy: None,
            sinks: Vec::new(),
            delivery: DeliveryConfig::default(),
            hostname: "localhost".to_string(),
            broadcast_capacity: 1024,
        }
    }

    pub fn channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn DeliveryPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Additional publisher next to the in-process broadcast.
    pub fn sink(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.sinks.push(publisher);
        self
    }

    pub fn delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    pub fn build(self) -> Engine {
        let live = BroadcastPublisher::new(self.broadcast_capacity);
        let mut sinks: Vec<Arc<dyn Publisher>> = vec![Arc::new(live.clone())];
        sinks.extend(self.sinks);
        let publisher: Arc<dyn Publisher> = Arc::new(FanoutPublisher::new(sinks));

        let mut dispatcher =
            NotificationDispatcher::new(self.storage.clone(), self.channels, &self.delivery, self.hostname.clone());
        if let Some(policy) = self.policy {
            dispatcher = dispatcher.with_policy(policy);
        }
        let dispatcher = Arc::new(dispatcher);

        let alerts = Arc::new(AlertInstanceManager::new(
            self.storage.clone(),
            dispatcher.clone(),
            publisher.clone(),
            self.hostname,
        ));
        let evaluator = Arc::new(AlertRuleEvaluator::new(self.storage.clone(), alerts.clone()));
        let ingestor = Arc::new(MetricIngestor::new(self.storage.clone(), publisher.clone(), evaluator.clone()));

        Engine {
            storage: self.storage,
            publisher,
            dispatcher,
            alerts,
            evaluator,
            ingestor,
            live,
        }
    }
}
