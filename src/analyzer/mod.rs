pub mod threshold;
pub mod window;

use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::sync::Arc;

use crate::condition::Condition;
use crate::error::{EngineError, Result};
use crate::lifecycle::{AlertInstanceManager, FireOutcome};
use crate::storage::Storage;
use crate::types::{AlertRule, MetricValue};

/// Decision of one rule evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub fire: bool,
    /// Sample value or window aggregate the decision was based on.
    pub observed: Option<f64>,
}

impl Verdict {
    pub fn quiet() -> Self {
        Self { fire: false, observed: None }
    }
}

/// Outcome counters of one full evaluation sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub fired: usize,
    pub created: usize,
    pub failed: usize,
    /// Instant rules without any sample, and rules on disabled metrics.
    pub skipped: usize,
}

/// Decides whether alert rules currently hold and hands firing decisions
/// to the instance manager.
pub struct AlertRuleEvaluator {
    storage: Storage,
    alerts: Arc<AlertInstanceManager>,
}

impl AlertRuleEvaluator {
    pub fn new(storage: Storage, alerts: Arc<AlertInstanceManager>) -> Self {
        Self { storage, alerts }
    }

    /// Should `rule` fire given the freshly recorded `sample`?
    pub fn evaluate(&self, rule: &AlertRule, sample: &MetricValue) -> Result<Verdict> {
        self.evaluate_at(rule, Some(sample), Utc::now())
    }

    /// Evaluate `rule` as of `now`. Instant rules need a sample; windowed
    /// rules read their window from the store and ignore its value.
    pub fn evaluate_at(&self, rule: &AlertRule, sample: Option<&MetricValue>, now: DateTime<Utc>) -> Result<Verdict> {
        if let Some(sample) = sample {
            if sample.metric != rule.metric {
                return Err(EngineError::InvalidSample {
                    metric: sample.metric.clone(),
                    reason: format!("rule '{}' watches '{}'", rule.name, rule.metric),
                });
            }
        }

        match rule.condition {
            Condition::Instant { op } => Ok(match sample {
                Some(sample) => threshold::check_sample(sample, op, rule.threshold),
                None => Verdict::quiet(),
            }),
            Condition::Windowed { aggregation, op, .. } => {
                let window = rule.condition.window().ok_or_else(|| {
                    EngineError::InvalidRuleCondition(format!("rule '{}' has no window", rule.name))
                })?;
                Ok(window::check_window(&self.storage, &rule.metric, aggregation, window, op, rule.threshold, now))
            }
        }
    }

    /// Evaluate `rule`, record the evaluation time, and hand a firing
    /// decision to the instance manager.
    pub async fn check(&self, rule: &AlertRule, sample: Option<&MetricValue>) -> Result<Option<FireOutcome>> {
        let now = Utc::now();
        let verdict = self.evaluate_at(rule, sample, now);
        self.storage.touch_rule_evaluation(rule.id, now);
        let verdict = verdict?;

        if !verdict.fire {
            return Ok(None);
        }

        let observed = verdict.observed.or(sample.map(|s| s.value)).unwrap_or(rule.threshold);
        let labels = sample.map(|s| s.labels.clone()).unwrap_or_else(SmallVec::new);
        Ok(Some(self.alerts.on_fire(rule, observed, &labels).await))
    }

    /// Re-evaluate every enabled rule. Windowed rules run unconditionally,
    /// instant rules against the latest sample of their metric. A failing
    /// rule is logged and does not stop the sweep.
    pub async fn evaluate_all(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for rule in self.storage.enabled_rules() {
            let metric_enabled = self.storage.metric(&rule.metric).is_some_and(|m| m.enabled);
            if !metric_enabled {
                self.storage.touch_rule_evaluation(rule.id, Utc::now());
                report.skipped += 1;
                continue;
            }

            let latest = self.storage.latest(&rule.metric);
            if !rule.condition.is_windowed() && latest.is_none() {
                self.storage.touch_rule_evaluation(rule.id, Utc::now());
                report.skipped += 1;
                continue;
            }

            report.evaluated += 1;
            match self.check(&rule, latest.as_ref()).await {
                Ok(Some(outcome)) => {
                    report.fired += 1;
                    if outcome.is_created() {
                        report.created += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(rule = %rule.name, rule_id = rule.id, error = %e, "Rule evaluation failed");
                }
            }
        }

        tracing::debug!(
            evaluated = report.evaluated,
            fired = report.fired,
            created = report.created,
            failed = report.failed,
            skipped = report.skipped,
            "Rule evaluation sweep finished"
        );
        report
    }
}
