//! Alert instance lifecycle.
//!
//! A rule has at most one `active` instance at a time. The read-check-create
//! sequence in [`AlertInstanceManager::on_fire`] runs under a mutex keyed by
//! rule id, so an ingest-triggered evaluation and the periodic sweep cannot
//! both create an instance for the same rule.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::alerter::NotificationDispatcher;
use crate::error::{EngineError, Result};
use crate::publisher::{self, AlertEventKind, Publisher};
use crate::storage::Storage;
use crate::types::{AlertInstance, AlertRule, AlertStatus, InstanceId, Labels, RuleId};

/// Result of handling a firing decision
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    /// A new active instance was created.
    Created(AlertInstance),
    /// The rule already had an active instance; it is returned unchanged.
    Existing(AlertInstance),
}

impl FireOutcome {
    pub fn instance(&self) -> &AlertInstance {
        match self {
            FireOutcome::Created(i) | FireOutcome::Existing(i) => i,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, FireOutcome::Created(_))
    }
}

pub struct AlertInstanceManager {
    storage: Storage,
    dispatcher: Arc<NotificationDispatcher>,
    publisher: Arc<dyn Publisher>,
    rule_locks: Mutex<HashMap<RuleId, Arc<Mutex<()>>>>,
    hostname: String,
}

impl AlertInstanceManager {
    pub fn new(
        storage: Storage,
        dispatcher: Arc<NotificationDispatcher>,
        publisher: Arc<dyn Publisher>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            publisher,
            rule_locks: Mutex::new(HashMap::new()),
            hostname: hostname.into(),
        }
    }

    fn rule_lock(&self, rule_id: RuleId) -> Arc<Mutex<()>> {
        self.rule_locks.lock().entry(rule_id).or_default().clone()
    }

    /// Handle a firing decision for `rule`.
    ///
    /// `observed` is the sample value (instant rules) or the window
    /// aggregate (windowed rules). Only a newly created instance is
    /// published and handed to the dispatcher.
    pub async fn on_fire(&self, rule: &AlertRule, observed: f64, labels: &Labels) -> FireOutcome {
        let outcome = self.check_and_create(rule, observed, labels, Utc::now());

        if let FireOutcome::Created(ref instance) = outcome {
            info!(
                rule = %rule.name,
                instance_id = instance.id,
                severity = %instance.severity,
                value = observed,
                "Alert triggered"
            );
            publisher::publish_alert(self.publisher.as_ref(), AlertEventKind::Triggered, instance, &self.hostname)
                .await;
            self.dispatcher.fan_out(instance, rule).await;
        }

        outcome
    }

    fn check_and_create(&self, rule: &AlertRule, observed: f64, labels: &Labels, now: DateTime<Utc>) -> FireOutcome {
        let lock = self.rule_lock(rule.id);
        let _guard = lock.lock();

        if let Some(existing) = self.storage.active_instance(rule.id) {
            debug!(rule = %rule.name, instance_id = existing.id, "Alert already active, not duplicating");
            return FireOutcome::Existing(existing);
        }

        let instance = self.storage.insert_instance(AlertInstance {
            id: 0,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            metric: rule.metric.clone(),
            status: AlertStatus::Active,
            severity: rule.severity,
            triggered_value: observed,
            triggered_labels: labels.clone(),
            message: format_message(rule, observed),
            triggered_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            acknowledge_comment: None,
            resolved_at: None,
            resolved_by: None,
            resolution_reason: None,
            auto_resolved: false,
        });
        self.storage.touch_rule_triggered(rule.id, now);

        FireOutcome::Created(instance)
    }

    /// Move an `active` instance to `acknowledged`.
    pub async fn acknowledge(&self, id: InstanceId, actor: &str, comment: Option<&str>) -> Result<AlertInstance> {
        let now = Utc::now();
        let instance = self.storage.update_instance(id, |i| {
            if i.status != AlertStatus::Active {
                return Err(EngineError::InvalidTransition { id, from: i.status, action: "acknowledge" });
            }
            i.status = AlertStatus::Acknowledged;
            i.acknowledged_at = Some(now);
            i.acknowledged_by = Some(actor.to_string());
            i.acknowledge_comment = comment.map(str::to_string);
            Ok(())
        })?;

        info!(instance_id = id, actor, "Alert acknowledged");
        publisher::publish_alert(self.publisher.as_ref(), AlertEventKind::Acknowledged, &instance, &self.hostname)
            .await;
        Ok(instance)
    }

    /// Move an `active` or `acknowledged` instance to `resolved`.
    pub async fn resolve(&self, id: InstanceId, actor: &str, reason: Option<&str>) -> Result<AlertInstance> {
        let now = Utc::now();
        let instance = self.storage.update_instance(id, |i| {
            if i.status == AlertStatus::Resolved {
                return Err(EngineError::InvalidTransition { id, from: i.status, action: "resolve" });
            }
            i.status = AlertStatus::Resolved;
            i.resolved_at = Some(now);
            i.resolved_by = Some(actor.to_string());
            i.resolution_reason = reason.map(str::to_string);
            Ok(())
        })?;

        info!(instance_id = id, actor, "Alert resolved");
        publisher::publish_alert(self.publisher.as_ref(), AlertEventKind::Resolved, &instance, &self.hostname)
            .await;
        Ok(instance)
    }
}

fn format_message(rule: &AlertRule, observed: f64) -> String {
    format!(
        "{}: {} is {:.2} (threshold {} {:.2})",
        rule.name,
        rule.condition.describe(&rule.metric),
        observed,
        rule.condition.op(),
        rule.threshold
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertRule, RuleSpec};

    #[test]
    fn message_names_rule_condition_and_value() {
        let rule = AlertRule::from_spec(1, RuleSpec::new("high_cpu", "cpu.load", "greater_than", 90.0)).unwrap();
        assert_eq!(format_message(&rule, 95.0), "high_cpu: cpu.load is 95.00 (threshold > 90.00)");

        let rule = AlertRule::from_spec(2, RuleSpec::new("slow", "cpu.load", "avg_5", 3.0).operator("<=")).unwrap();
        assert_eq!(format_message(&rule, 2.5), "slow: avg(cpu.load) over 5m is 2.50 (threshold <= 3.00)");
    }
}
