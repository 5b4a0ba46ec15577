use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analyzer::AlertRuleEvaluator;
use crate::error::{EngineError, Result};
use crate::publisher::{self, Publisher};
use crate::storage::Storage;
use crate::types::{Label, Labels, MetricDefinition, MetricValue, SampleSummary};

/// One sample as offered by a producer
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub metric: String,
    pub value: f64,
    pub labels: Labels,
    /// Defaults to the time of recording.
    pub timestamp: Option<DateTime<Utc>>,
    pub summary: Option<SampleSummary>,
}

impl Observation {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            labels: SmallVec::new(),
            timestamp: None,
            summary: None,
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push(Label::new(key, value));
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_summary(mut self, summary: SampleSummary) -> Self {
        self.summary = Some(summary);
        self
    }
}

/// Validates and records incoming samples, then fans them out to the
/// real-time publisher and to the rules bound to the metric.
pub struct MetricIngestor {
    storage: Storage,
    publisher: Arc<dyn Publisher>,
    evaluator: Arc<AlertRuleEvaluator>,
}

impl MetricIngestor {
    pub fn new(storage: Storage, publisher: Arc<dyn Publisher>, evaluator: Arc<AlertRuleEvaluator>) -> Self {
        Self { storage, publisher, evaluator }
    }

    pub async fn record(
        &self,
        name: &str,
        value: f64,
        labels: Labels,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<MetricValue> {
        self.record_observation(Observation {
            metric: name.to_string(),
            value,
            labels,
            timestamp,
            summary: None,
        })
        .await
    }

    /// Persist `observation` and run its side effects.
    ///
    /// Only an unknown/disabled metric or an invalid sample is returned as
    /// an error. Publishing and rule evaluation failures are logged; the
    /// stored sample is kept either way.
    pub async fn record_observation(&self, observation: Observation) -> Result<MetricValue> {
        let definition = self
            .storage
            .metric(&observation.metric)
            .filter(|d| d.enabled)
            .ok_or_else(|| EngineError::UnknownMetric(observation.metric.clone()))?;

        validate(&definition, &observation)?;

        let sample = self.storage.insert_sample(
            &definition.name,
            observation.value,
            observation.labels,
            observation.timestamp.unwrap_or_else(Utc::now),
            observation.summary,
        );
        debug!(metric = %sample.metric, value = sample.value, sample_id = sample.id, "Recorded sample");

        publisher::publish_metric(self.publisher.as_ref(), &sample).await;

        for rule in self.storage.enabled_rules_for(&definition.name) {
            if let Err(e) = self.evaluator.check(&rule, Some(&sample)).await {
                warn!(rule = %rule.name, rule_id = rule.id, error = %e, "Rule evaluation on ingest failed");
            }
        }

        Ok(sample)
    }
}

fn validate(definition: &MetricDefinition, observation: &Observation) -> Result<()> {
    let invalid = |reason: String| EngineError::InvalidSample {
        metric: definition.name.clone(),
        reason,
    };

    if !observation.value.is_finite() {
        return Err(invalid(format!("value {} is not finite", observation.value)));
    }

    if let Some((_, label)) = observation
        .labels
        .iter()
        .enumerate()
        .find(|(i, l)| observation.labels[..*i].iter().any(|earlier| earlier.key == l.key))
    {
        return Err(invalid(format!("label '{}' is given more than once", label.key)));
    }

    if !definition.label_keys.is_empty() {
        if let Some(label) = observation
            .labels
            .iter()
            .find(|l| !definition.label_keys.iter().any(|k| k == &l.key))
        {
            return Err(invalid(format!("label '{}' is not declared", label.key)));
        }
    }

    if observation.summary.is_some() && !definition.kind.accepts_summary() {
        return Err(invalid(format!("{:?} samples cannot carry a summary", definition.kind)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricKind;

    fn summary() -> SampleSummary {
        SampleSummary { count: 3, sum: 6.0, quantiles: SmallVec::new() }
    }

    #[test]
    fn rejects_non_finite_values() {
        let def = MetricDefinition::new("m", MetricKind::Gauge);
        assert!(validate(&def, &Observation::new("m", f64::NAN)).is_err());
        assert!(validate(&def, &Observation::new("m", f64::INFINITY)).is_err());
        assert!(validate(&def, &Observation::new("m", 1.0)).is_ok());
    }

    #[test]
    fn enforces_declared_label_keys() {
        let def = MetricDefinition::new("m", MetricKind::Gauge).with_label_keys(["host"]);
        assert!(validate(&def, &Observation::new("m", 1.0).label("host", "a")).is_ok());
        let err = validate(&def, &Observation::new("m", 1.0).label("region", "eu")).unwrap_err();
        assert!(err.to_string().contains("region"));

        let open = MetricDefinition::new("m", MetricKind::Gauge);
        assert!(validate(&open, &Observation::new("m", 1.0).label("anything", "x")).is_ok());
    }

    #[test]
    fn rejects_repeated_label_keys() {
        let def = MetricDefinition::new("m", MetricKind::Gauge);
        let obs = Observation::new("m", 1.0).label("host", "a").label("host", "b");
        let err = validate(&def, &obs).unwrap_err();
        assert!(err.to_string().contains("host"));

        let distinct = Observation::new("m", 1.0).label("host", "a").label("region", "eu");
        assert!(validate(&def, &distinct).is_ok());
    }

    #[test]
    fn summaries_only_on_distribution_kinds() {
        let gauge = MetricDefinition::new("m", MetricKind::Gauge);
        let histogram = MetricDefinition::new("m", MetricKind::Histogram);
        let obs = Observation::new("m", 2.0).with_summary(summary());
        assert!(validate(&gauge, &obs).is_err());
        assert!(validate(&histogram, &obs).is_ok());
    }
}
