pub mod engine;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::ingest::Observation;
use crate::storage::Storage;

/// Trait for periodic metric producers.
///
/// Collectors know nothing about alerting: the scheduler feeds whatever
/// they return through the normal ingestion path.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Human-readable name for this collector
    fn name(&self) -> &str;

    /// Collect metrics. Called on every collection tick.
    async fn collect(&mut self) -> Result<Vec<Observation>>;
}

/// Create all enabled collectors, registering the metric definitions they
/// report.
pub fn create_collectors(config: &Config, storage: &Storage) -> Result<Vec<Box<dyn Collector>>> {
    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();

    if config.collector.engine_stats {
        collectors.push(Box::new(engine::EngineStatsCollector::new(storage.clone())?));
    }

    tracing::info!(count = collectors.len(), "Initialized collectors");
    Ok(collectors)
}
