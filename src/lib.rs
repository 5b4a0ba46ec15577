pub mod alerter;
pub mod analyzer;
pub mod collector;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod publisher;
pub mod scheduler;
pub mod storage;

pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use smallvec::SmallVec;
    use std::str::FromStr;

    use crate::condition::Condition;
    use crate::error::EngineError;

    pub type RuleId = u64;
    pub type InstanceId = u64;
    pub type NotificationId = u64;

    /// Label set attached to a sample. Order carries no meaning.
    pub type Labels = SmallVec<[Label; 4]>;

    /// A label key-value pair
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Label {
        pub key: String,
        pub value: String,
    }

    impl Label {
        pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
            Self { key: key.into(), value: value.into() }
        }
    }

    /// Build a label set from `(key, value)` pairs.
    pub fn labels<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Labels
    where
        K: Into<String>,
        V: Into<String>,
    {
        pairs.into_iter().map(|(k, v)| Label::new(k, v)).collect()
    }

    /// Kind of time series a definition describes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MetricKind {
        Counter,
        Gauge,
        Histogram,
        Summary,
        Timer,
    }

    impl MetricKind {
        /// Whether samples of this kind may carry count/sum/quantiles.
        pub fn accepts_summary(&self) -> bool {
            matches!(self, MetricKind::Histogram | MetricKind::Summary)
        }
    }

    /// Registered identity and schema of a named time series
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct MetricDefinition {
        pub name: String,
        pub kind: MetricKind,
        #[serde(default)]
        pub unit: String,
        #[serde(default)]
        pub description: String,
        /// Allowed label keys. Empty means any label is accepted.
        #[serde(default)]
        pub label_keys: Vec<String>,
        #[serde(default = "default_collection_interval")]
        pub collection_interval_secs: u64,
        #[serde(default = "default_retention")]
        pub retention_secs: u64,
        #[serde(default = "default_true")]
        pub enabled: bool,
    }

    impl MetricDefinition {
        pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
            Self {
                name: name.into(),
                kind,
                unit: String::new(),
                description: String::new(),
                label_keys: Vec::new(),
                collection_interval_secs: default_collection_interval(),
                retention_secs: default_retention(),
                enabled: true,
            }
        }

        pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
            self.unit = unit.into();
            self
        }

        pub fn with_label_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
            self.label_keys = keys.into_iter().map(Into::into).collect();
            self
        }

        pub fn with_retention_secs(mut self, secs: u64) -> Self {
            self.retention_secs = secs;
            self
        }
    }

    /// Extra payload carried by histogram and summary samples
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SampleSummary {
        pub count: u64,
        pub sum: f64,
        #[serde(default)]
        pub quantiles: SmallVec<[Quantile; 4]>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Quantile {
        pub quantile: f64,
        pub value: f64,
    }

    /// A single stored metric measurement
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct MetricValue {
        pub id: u64,
        pub metric: String,
        pub value: f64,
        pub labels: Labels,
        pub timestamp: DateTime<Utc>,
        pub summary: Option<SampleSummary>,
    }

    /// Alert severity levels
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Severity {
        Info,
        #[serde(alias = "warning")]
        Warn,
        Critical,
        Emergency,
    }

    impl Default for Severity {
        fn default() -> Self {
            Severity::Warn
        }
    }

    impl std::fmt::Display for Severity {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Severity::Info => write!(f, "INFO"),
                Severity::Warn => write!(f, "WARN"),
                Severity::Critical => write!(f, "CRITICAL"),
                Severity::Emergency => write!(f, "EMERGENCY"),
            }
        }
    }

    impl FromStr for Severity {
        type Err = EngineError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "info" => Ok(Severity::Info),
                "warn" | "warning" => Ok(Severity::Warn),
                "critical" => Ok(Severity::Critical),
                "emergency" => Ok(Severity::Emergency),
                other => Err(EngineError::InvalidRuleCondition(format!("unknown severity '{other}'"))),
            }
        }
    }

    /// Delivery channel kinds
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ChannelKind {
        Email,
        Slack,
        Discord,
        Webhook,
    }

    impl std::fmt::Display for ChannelKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let s = match self {
                ChannelKind::Email => "email",
                ChannelKind::Slack => "slack",
                ChannelKind::Discord => "discord",
                ChannelKind::Webhook => "webhook",
            };
            write!(f, "{}", s)
        }
    }

    /// One entry of a rule's notification channel list
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChannelConfig {
        #[serde(rename = "type")]
        pub kind: ChannelKind,
        /// Email address, webhook URL or chat channel, depending on `kind`.
        pub recipient: String,
    }

    impl ChannelConfig {
        pub fn new(kind: ChannelKind, recipient: impl Into<String>) -> Self {
            Self { kind, recipient: recipient.into() }
        }
    }

    /// Unparsed rule as supplied by administration or configuration.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct RuleSpec {
        pub name: String,
        pub metric: String,
        pub condition: String,
        pub threshold: f64,
        /// Comparison used by windowed conditions.
        #[serde(default)]
        pub operator: Option<String>,
        #[serde(default)]
        pub window_minutes: Option<u32>,
        #[serde(default)]
        pub severity: Severity,
        #[serde(default)]
        pub channels: Vec<ChannelConfig>,
        #[serde(default = "default_true")]
        pub enabled: bool,
    }

    impl RuleSpec {
        pub fn new(
            name: impl Into<String>,
            metric: impl Into<String>,
            condition: impl Into<String>,
            threshold: f64,
        ) -> Self {
            Self {
                name: name.into(),
                metric: metric.into(),
                condition: condition.into(),
                threshold,
                operator: None,
                window_minutes: None,
                severity: Severity::default(),
                channels: Vec::new(),
                enabled: true,
            }
        }

        pub fn operator(mut self, op: impl Into<String>) -> Self {
            self.operator = Some(op.into());
            self
        }

        pub fn window_minutes(mut self, minutes: u32) -> Self {
            self.window_minutes = Some(minutes);
            self
        }

        pub fn severity(mut self, severity: Severity) -> Self {
            self.severity = severity;
            self
        }

        pub fn channel(mut self, kind: ChannelKind, recipient: impl Into<String>) -> Self {
            self.channels.push(ChannelConfig::new(kind, recipient));
            self
        }
    }

    /// A rule whose condition has been parsed and validated.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct AlertRule {
        pub id: RuleId,
        pub name: String,
        pub metric: String,
        pub condition_expr: String,
        pub condition: Condition,
        pub threshold: f64,
        pub severity: Severity,
        pub channels: Vec<ChannelConfig>,
        pub enabled: bool,
        pub last_evaluation: Option<DateTime<Utc>>,
        pub last_triggered: Option<DateTime<Utc>>,
    }

    impl AlertRule {
        /// Parse `spec` into a rule. The id is assigned by the store.
        pub fn from_spec(id: RuleId, spec: RuleSpec) -> Result<Self, EngineError> {
            let condition = Condition::parse(&spec.condition, spec.operator.as_deref(), spec.window_minutes)?;
            if !spec.threshold.is_finite() {
                return Err(EngineError::InvalidRuleCondition(format!(
                    "rule '{}' has a non-finite threshold",
                    spec.name
                )));
            }
            Ok(Self {
                id,
                name: spec.name,
                metric: spec.metric,
                condition_expr: spec.condition,
                condition,
                threshold: spec.threshold,
                severity: spec.severity,
                channels: spec.channels,
                enabled: spec.enabled,
                last_evaluation: None,
                last_triggered: None,
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum AlertStatus {
        Active,
        Acknowledged,
        Resolved,
    }

    impl std::fmt::Display for AlertStatus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                AlertStatus::Active => write!(f, "active"),
                AlertStatus::Acknowledged => write!(f, "acknowledged"),
                AlertStatus::Resolved => write!(f, "resolved"),
            }
        }
    }

    /// One firing episode of a rule
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct AlertInstance {
        pub id: InstanceId,
        pub rule_id: RuleId,
        pub rule_name: String,
        pub metric: String,
        pub status: AlertStatus,
        pub severity: Severity,
        pub triggered_value: f64,
        pub triggered_labels: Labels,
        pub message: String,
        pub triggered_at: DateTime<Utc>,
        pub acknowledged_at: Option<DateTime<Utc>>,
        pub acknowledged_by: Option<String>,
        pub acknowledge_comment: Option<String>,
        pub resolved_at: Option<DateTime<Utc>>,
        pub resolved_by: Option<String>,
        pub resolution_reason: Option<String>,
        pub auto_resolved: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum NotificationStatus {
        Pending,
        Sent,
        Failed,
    }

    impl std::fmt::Display for NotificationStatus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                NotificationStatus::Pending => write!(f, "pending"),
                NotificationStatus::Sent => write!(f, "sent"),
                NotificationStatus::Failed => write!(f, "failed"),
            }
        }
    }

    /// Delivery record for one instance on one channel
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct AlertNotification {
        pub id: NotificationId,
        pub instance_id: InstanceId,
        pub channel: ChannelKind,
        /// Copied from the instance when the record is created.
        pub severity: Severity,
        pub recipient: String,
        pub subject: String,
        pub message: String,
        pub status: NotificationStatus,
        pub created_at: DateTime<Utc>,
        pub sent_at: Option<DateTime<Utc>>,
        pub delivered_at: Option<DateTime<Utc>>,
        pub error_message: Option<String>,
        pub retry_count: u32,
        /// Earliest time the retry sweep may pick this record up again.
        pub next_attempt_at: Option<DateTime<Utc>>,
    }

    impl AlertNotification {
        pub fn channel_config(&self) -> ChannelConfig {
            ChannelConfig::new(self.channel, self.recipient.clone())
        }
    }

    /// Alert snapshot handed to delivery policies and live subscribers
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct AlertPayload {
        pub instance_id: InstanceId,
        pub rule_id: RuleId,
        pub rule_name: String,
        pub metric: String,
        pub status: AlertStatus,
        pub severity: Severity,
        pub value: f64,
        pub labels: Labels,
        pub message: String,
        pub triggered_at: DateTime<Utc>,
        pub hostname: String,
    }

    impl AlertPayload {
        pub fn new(instance: &AlertInstance, hostname: &str) -> Self {
            Self {
                instance_id: instance.id,
                rule_id: instance.rule_id,
                rule_name: instance.rule_name.clone(),
                metric: instance.metric.clone(),
                status: instance.status,
                severity: instance.severity,
                value: instance.triggered_value,
                labels: instance.triggered_labels.clone(),
                message: instance.message.clone(),
                triggered_at: instance.triggered_at,
                hostname: hostname.to_string(),
            }
        }
    }

    fn default_true() -> bool { true }
    fn default_collection_interval() -> u64 { 30 }
    fn default_retention() -> u64 { 7 * 24 * 3600 }
}
