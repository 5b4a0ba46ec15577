use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use crate::types::{
    AlertInstance, AlertNotification, AlertRule, AlertStatus, InstanceId, Labels, MetricDefinition,
    MetricValue, NotificationId, NotificationStatus, RuleId, RuleSpec, SampleSummary,
};

/// 100 years.
const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 3600;

/// Thread-safe store for definitions, samples, rules, alert instances and
/// notifications.
///
/// Cloning is cheap; every clone shares the same data. Each method is one
/// atomic read or write; nothing spans more than one row except the
/// read-only listings.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<RwLock<StorageInner>>,
}

struct StorageInner {
    definitions: HashMap<String, MetricDefinition>,
    series: HashMap<String, RingBuffer>,
    rules: BTreeMap<RuleId, AlertRule>,
    instances: BTreeMap<InstanceId, AlertInstance>,
    notifications: BTreeMap<NotificationId, AlertNotification>,
    /// Delivery attempts in flight, with the time their claim lapses.
    claims: HashMap<NotificationId, DateTime<Utc>>,
    capacity: usize,
    next_sample_id: u64,
    next_rule_id: RuleId,
    next_instance_id: InstanceId,
    next_notification_id: NotificationId,
}

impl StorageInner {
    /// Samples older than this are outside the metric's retention and
    /// outside every enabled rule window on it. `None` protects all.
    fn evictable_before(&self, metric: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let retention = self
            .definitions
            .get(metric)
            .map_or(MAX_RETENTION_SECS, |d| d.retention_secs.min(MAX_RETENTION_SECS));
        let longest_window = self
            .rules
            .values()
            .filter(|r| r.enabled && r.metric == metric)
            .filter_map(|r| r.condition.window())
            .max()
            .unwrap_or_else(Duration::zero);
        now.checked_sub_signed(Duration::seconds(retention as i64).max(longest_window))
    }
}

/// Samples of one definition in arrival order. `capacity` is a soft
/// limit: samples still within retention or a rule window are never
/// dropped to honour it.
struct RingBuffer {
    data: VecDeque<MetricValue>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append `sample`. While at capacity, the oldest samples are dropped
    /// only if they are older than `evictable_before`; otherwise the
    /// buffer grows past capacity. Returns the number of samples dropped.
    fn push(&mut self, sample: MetricValue, evictable_before: Option<DateTime<Utc>>) -> usize {
        let mut evicted = 0;
        if let Some(cutoff) = evictable_before {
            while self.data.len() >= self.capacity && self.data.front().is_some_and(|s| s.timestamp < cutoff) {
                self.data.pop_front();
                evicted += 1;
            }
        }
        self.data.push_back(sample);
        evicted
    }

    fn latest(&self) -> Option<&MetricValue> {
        self.data.back()
    }

    /// Samples with `timestamp >= cutoff`, in arrival order.
    fn since(&self, cutoff: DateTime<Utc>) -> Vec<MetricValue> {
        self.data.iter().filter(|s| s.timestamp >= cutoff).cloned().collect()
    }

    fn retain_since(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.data.len();
        self.data.retain(|s| s.timestamp >= cutoff);
        before - self.data.len()
    }
}

impl Storage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StorageInner {
                definitions: HashMap::new(),
                series: HashMap::new(),
                rules: BTreeMap::new(),
                instances: BTreeMap::new(),
                notifications: BTreeMap::new(),
                claims: HashMap::new(),
                capacity: (config.ring_buffer_size as usize).max(1),
                next_sample_id: 1,
                next_rule_id: 1,
                next_instance_id: 1,
                next_notification_id: 1,
            })),
        }
    }

    // ---- metric definitions ----

    pub fn register_metric(&self, definition: MetricDefinition) -> Result<MetricDefinition> {
        let mut inner = self.inner.write();
        if inner.definitions.contains_key(&definition.name) {
            return Err(EngineError::DuplicateMetric(definition.name));
        }
        tracing::debug!(metric = %definition.name, kind = ?definition.kind, "Registered metric");
        inner.definitions.insert(definition.name.clone(), definition.clone());
        Ok(definition)
    }

    /// Replace every attribute of an existing definition except its name.
    pub fn update_metric(&self, definition: MetricDefinition) -> Result<MetricDefinition> {
        let mut inner = self.inner.write();
        match inner.definitions.get_mut(&definition.name) {
            Some(existing) => {
                *existing = definition.clone();
                Ok(definition)
            }
            None => Err(EngineError::UnknownMetric(definition.name)),
        }
    }

    pub fn set_metric_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let definition = inner
            .definitions
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownMetric(name.to_string()))?;
        definition.enabled = enabled;
        Ok(())
    }

    pub fn metric(&self, name: &str) -> Option<MetricDefinition> {
        self.inner.read().definitions.get(name).cloned()
    }

    pub fn metrics(&self) -> Vec<MetricDefinition> {
        let mut all: Vec<_> = self.inner.read().definitions.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // ---- samples ----

    /// Append a sample. Callers validate it against the definition first.
    pub fn insert_sample(
        &self,
        metric: &str,
        value: f64,
        labels: Labels,
        timestamp: DateTime<Utc>,
        summary: Option<SampleSummary>,
    ) -> MetricValue {
        let mut inner = self.inner.write();
        let id = inner.next_sample_id;
        inner.next_sample_id += 1;

        let sample = MetricValue {
            id,
            metric: metric.to_string(),
            value,
            labels,
            timestamp,
            summary,
        };

        let capacity = inner.capacity;
        let evictable_before = inner.evictable_before(metric, Utc::now());
        let evicted = inner
            .series
            .entry(metric.to_string())
            .or_insert_with(|| RingBuffer::new(capacity))
            .push(sample.clone(), evictable_before);
        if evicted > 0 {
            tracing::warn!(
                metric = %metric,
                evicted,
                capacity,
                "Sample buffer full, dropped samples past retention ahead of the purge"
            );
        }
        sample
    }

    /// Most recently arrived sample of `metric`.
    pub fn latest(&self, metric: &str) -> Option<MetricValue> {
        self.inner.read().series.get(metric)?.latest().cloned()
    }

    pub fn samples_since(&self, metric: &str, cutoff: DateTime<Utc>) -> Vec<MetricValue> {
        match self.inner.read().series.get(metric) {
            Some(buf) => buf.since(cutoff),
            None => Vec::new(),
        }
    }

    pub fn sample_count(&self, metric: &str) -> usize {
        self.inner.read().series.get(metric).map_or(0, |b| b.data.len())
    }

    /// Drop samples older than their definition's retention period.
    /// Returns the number of samples removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut removed = 0;
        for (name, buffer) in inner.series.iter_mut() {
            let Some(definition) = inner.definitions.get(name) else { continue };
            let retention = Duration::seconds(definition.retention_secs.min(MAX_RETENTION_SECS) as i64);
            if let Some(cutoff) = now.checked_sub_signed(retention) {
                removed += buffer.retain_since(cutoff);
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Purged expired samples");
        }
        removed
    }

    // ---- rules ----

    /// Parse and store a new rule. The metric must be registered.
    pub fn create_rule(&self, spec: RuleSpec) -> Result<AlertRule> {
        let mut inner = self.inner.write();
        if !inner.definitions.contains_key(&spec.metric) {
            return Err(EngineError::UnknownMetric(spec.metric));
        }
        let rule = AlertRule::from_spec(inner.next_rule_id, spec)?;
        inner.next_rule_id += 1;
        inner.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    /// Re-parse a rule from `spec`, keeping its id and timestamps.
    pub fn update_rule(&self, id: RuleId, spec: RuleSpec) -> Result<AlertRule> {
        let mut inner = self.inner.write();
        if !inner.definitions.contains_key(&spec.metric) {
            return Err(EngineError::UnknownMetric(spec.metric));
        }
        let existing = inner.rules.get(&id).ok_or(EngineError::UnknownRule(id))?;
        let mut rule = AlertRule::from_spec(id, spec)?;
        rule.last_evaluation = existing.last_evaluation;
        rule.last_triggered = existing.last_triggered;
        inner.rules.insert(id, rule.clone());
        Ok(rule)
    }

    pub fn set_rule_enabled(&self, id: RuleId, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let rule = inner.rules.get_mut(&id).ok_or(EngineError::UnknownRule(id))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn rule(&self, id: RuleId) -> Option<AlertRule> {
        self.inner.read().rules.get(&id).cloned()
    }

    pub fn enabled_rules(&self) -> Vec<AlertRule> {
        self.inner.read().rules.values().filter(|r| r.enabled).cloned().collect()
    }

    pub fn enabled_rules_for(&self, metric: &str) -> Vec<AlertRule> {
        self.inner
            .read()
            .rules
            .values()
            .filter(|r| r.enabled && r.metric == metric)
            .cloned()
            .collect()
    }

    pub fn touch_rule_evaluation(&self, id: RuleId, at: DateTime<Utc>) {
        if let Some(rule) = self.inner.write().rules.get_mut(&id) {
            rule.last_evaluation = Some(at);
        }
    }

    pub fn touch_rule_triggered(&self, id: RuleId, at: DateTime<Utc>) {
        if let Some(rule) = self.inner.write().rules.get_mut(&id) {
            rule.last_triggered = Some(at);
        }
    }

    // ---- alert instances ----

    /// The rule's `active` instance, if any.
    pub fn active_instance(&self, rule_id: RuleId) -> Option<AlertInstance> {
        self.inner
            .read()
            .instances
            .values()
            .rev()
            .find(|i| i.rule_id == rule_id && i.status == AlertStatus::Active)
            .cloned()
    }

    /// Store a new instance, assigning its id.
    pub fn insert_instance(&self, mut instance: AlertInstance) -> AlertInstance {
        let mut inner = self.inner.write();
        instance.id = inner.next_instance_id;
        inner.next_instance_id += 1;
        inner.instances.insert(instance.id, instance.clone());
        instance
    }

    pub fn instance(&self, id: InstanceId) -> Option<AlertInstance> {
        self.inner.read().instances.get(&id).cloned()
    }

    /// Apply `update` to one instance atomically. If `update` fails the
    /// stored row is left untouched.
    pub fn update_instance<F>(&self, id: InstanceId, update: F) -> Result<AlertInstance>
    where
        F: FnOnce(&mut AlertInstance) -> Result<()>,
    {
        let mut inner = self.inner.write();
        let stored = inner.instances.get_mut(&id).ok_or(EngineError::UnknownInstance(id))?;
        let mut draft = stored.clone();
        update(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    /// Instances ordered by id, optionally filtered by status.
    pub fn instances(&self, status: Option<AlertStatus>) -> Vec<AlertInstance> {
        self.inner
            .read()
            .instances
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect()
    }

    pub fn instances_for_rule(&self, rule_id: RuleId) -> Vec<AlertInstance> {
        self.inner
            .read()
            .instances
            .values()
            .filter(|i| i.rule_id == rule_id)
            .cloned()
            .collect()
    }

    // ---- notifications ----

    pub fn insert_notification(&self, mut notification: AlertNotification) -> AlertNotification {
        let mut inner = self.inner.write();
        notification.id = inner.next_notification_id;
        inner.next_notification_id += 1;
        inner.notifications.insert(notification.id, notification.clone());
        notification
    }

    pub fn notification(&self, id: NotificationId) -> Option<AlertNotification> {
        self.inner.read().notifications.get(&id).cloned()
    }

    pub fn update_notification<F>(&self, id: NotificationId, update: F) -> Result<AlertNotification>
    where
        F: FnOnce(&mut AlertNotification),
    {
        let mut inner = self.inner.write();
        let stored = inner
            .notifications
            .get_mut(&id)
            .ok_or(EngineError::UnknownNotification(id))?;
        update(stored);
        Ok(stored.clone())
    }

    /// Claim a notification for one delivery attempt until `until`.
    ///
    /// Returns `None` when it is already `sent` or another attempt holds a
    /// claim that has not lapsed at `now`.
    pub fn claim_notification(
        &self,
        id: NotificationId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<AlertNotification>> {
        let mut inner = self.inner.write();
        let notification = inner
            .notifications
            .get(&id)
            .ok_or(EngineError::UnknownNotification(id))?
            .clone();
        if notification.status == NotificationStatus::Sent {
            return Ok(None);
        }
        if inner.claims.get(&id).is_some_and(|lapses| *lapses > now) {
            return Ok(None);
        }
        inner.claims.insert(id, until);
        Ok(Some(notification))
    }

    /// Drop a claim without recording an outcome.
    pub fn release_notification(&self, id: NotificationId) {
        self.inner.write().claims.remove(&id);
    }

    /// Record the outcome of a claimed attempt and drop the claim. A
    /// notification that is already `sent` is left untouched.
    pub fn settle_notification<F>(&self, id: NotificationId, update: F) -> Result<AlertNotification>
    where
        F: FnOnce(&mut AlertNotification),
    {
        let mut inner = self.inner.write();
        inner.claims.remove(&id);
        let stored = inner
            .notifications
            .get_mut(&id)
            .ok_or(EngineError::UnknownNotification(id))?;
        if stored.status != NotificationStatus::Sent {
            update(stored);
        }
        Ok(stored.clone())
    }

    pub fn notifications_for_instance(&self, instance_id: InstanceId) -> Vec<AlertNotification> {
        self.inner
            .read()
            .notifications
            .values()
            .filter(|n| n.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Notifications the retry sweep should attempt, oldest first: every
    /// `pending` record, plus `failed` records with retries left. Records
    /// whose `next_attempt_at` lies in the future, or that an attempt
    /// currently holds claimed, are skipped.
    pub fn due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        max_retries: Option<u32>,
    ) -> Vec<AlertNotification> {
        let inner = self.inner.read();
        let mut due: Vec<_> = inner
            .notifications
            .values()
            .filter(|n| match n.status {
                NotificationStatus::Pending => true,
                NotificationStatus::Failed => max_retries.map_or(true, |max| n.retry_count < max),
                NotificationStatus::Sent => false,
            })
            .filter(|n| n.next_attempt_at.map_or(true, |at| at <= now))
            .filter(|n| inner.claims.get(&n.id).map_or(true, |lapses| *lapses <= now))
            .cloned()
            .collect();
        due.sort_by_key(|n| (n.created_at, n.id));
        due.truncate(limit);
        due
    }

    pub fn active_alert_count(&self) -> usize {
        self.inner
            .read()
            .instances
            .values()
            .filter(|i| i.status == AlertStatus::Active)
            .count()
    }

    pub fn pending_notification_count(&self) -> usize {
        self.inner
            .read()
            .notifications
            .values()
            .filter(|n| n.status != NotificationStatus::Sent)
            .count()
    }
}
