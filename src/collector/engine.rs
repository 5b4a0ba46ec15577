use anyhow::Result;
use async_trait::async_trait;

use super::Collector;
use crate::error::EngineError;
use crate::ingest::Observation;
use crate::storage::Storage;
use crate::types::{MetricDefinition, MetricKind};

pub const ACTIVE_ALERTS: &str = "alertd.active_alerts";
pub const PENDING_NOTIFICATIONS: &str = "alertd.pending_notifications";

/// Reports the engine's own gauges as ordinary samples
pub struct EngineStatsCollector {
    storage: Storage,
}

impl EngineStatsCollector {
    pub fn new(storage: Storage) -> Result<Self> {
        for (name, description) in [
            (ACTIVE_ALERTS, "Alert instances currently active"),
            (PENDING_NOTIFICATIONS, "Notifications not yet sent"),
        ] {
            let mut definition = MetricDefinition::new(name, MetricKind::Gauge).with_unit("count");
            definition.description = description.to_string();
            match storage.register_metric(definition) {
                Ok(_) | Err(EngineError::DuplicateMetric(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self { storage })
    }
}

#[async_trait]
impl Collector for EngineStatsCollector {
    fn name(&self) -> &str { "engine" }

    async fn collect(&mut self) -> Result<Vec<Observation>> {
        Ok(vec![
            Observation::new(ACTIVE_ALERTS, self.storage.active_alert_count() as f64),
            Observation::new(PENDING_NOTIFICATIONS, self.storage.pending_notification_count() as f64),
        ])
    }
}
