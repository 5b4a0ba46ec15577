//! Periodic background work: rule re-evaluation, notification retries and
//! the metric collection hook. Each activity runs in its own task on its
//! own cadence and stops when the shared cancellation token fires.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alerter::NotificationDispatcher;
use crate::analyzer::AlertRuleEvaluator;
use crate::collector::Collector;
use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::ingest::MetricIngestor;

pub struct Scheduler {
    evaluator: Arc<AlertRuleEvaluator>,
    dispatcher: Arc<NotificationDispatcher>,
    ingestor: Arc<MetricIngestor>,
    collectors: Vec<Box<dyn Collector>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(engine: &Engine, collectors: Vec<Box<dyn Collector>>, config: SchedulerConfig) -> Self {
        Self {
            evaluator: engine.evaluator.clone(),
            dispatcher: engine.dispatcher.clone(),
            ingestor: engine.ingestor.clone(),
            collectors,
            config,
        }
    }

    /// Spawn the three loops. They run until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let evaluator = self.evaluator;
        handles.push(tokio::spawn(run_periodic(
            "evaluation",
            secs(self.config.evaluation_interval_secs),
            token.clone(),
            move || {
                let evaluator = evaluator.clone();
                async move {
                    evaluator.evaluate_all().await;
                }
            },
        )));

        let dispatcher = self.dispatcher;
        let batch_size = self.config.retry_batch_size;
        handles.push(tokio::spawn(run_periodic(
            "notification-retry",
            secs(self.config.retry_interval_secs),
            token.clone(),
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher.retry_sweep(batch_size).await;
                }
            },
        )));

        let ingestor = self.ingestor;
        let collectors = Arc::new(Mutex::new(self.collectors));
        handles.push(tokio::spawn(run_periodic(
            "collection",
            secs(self.config.collection_interval_secs),
            token,
            move || {
                let ingestor = ingestor.clone();
                let collectors = collectors.clone();
                async move {
                    let mut collectors = collectors.lock().await;
                    collect_once(&ingestor, collectors.as_mut_slice()).await;
                }
            },
        )));

        info!(
            evaluation_secs = self.config.evaluation_interval_secs,
            retry_secs = self.config.retry_interval_secs,
            collection_secs = self.config.collection_interval_secs,
            "Scheduler started"
        );
        handles
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

/// Run every collector once and record what they return.
async fn collect_once(ingestor: &MetricIngestor, collectors: &mut [Box<dyn Collector>]) {
    for collector in collectors.iter_mut() {
        match collector.collect().await {
            Ok(observations) => {
                for observation in observations {
                    let metric = observation.metric.clone();
                    if let Err(e) = ingestor.record_observation(observation).await {
                        warn!(collector = collector.name(), metric = %metric, error = %e, "Failed to record sample");
                    }
                }
            }
            Err(e) => {
                warn!(collector = collector.name(), error = %e, "Collection failed");
            }
        }
    }
}

/// Drive `cycle` every `period` until `token` is cancelled.
///
/// A panicking cycle is logged and the next tick runs as usual.
/// Cancellation drops an in-flight cycle at its next await point.
async fn run_periodic<F, Fut>(name: &'static str, period: Duration, token: CancellationToken, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let run = AssertUnwindSafe(cycle()).catch_unwind();
        tokio::select! {
            _ = token.cancelled() => {
                info!(job = name, "Cycle cancelled");
                break;
            }
            result = run => {
                if result.is_err() {
                    error!(job = name, "Cycle panicked, continuing with next tick");
                }
            }
        }
    }

    info!(job = name, "Scheduler loop stopped");
}
