use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{MetricDefinition, RuleSpec};

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[cfg(feature = "nats")]
    #[serde(default)]
    pub nats: NatsConfig,
    /// Metric definitions registered at startup.
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
    /// Alert rules registered at startup.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { hostname: default_hostname(), log_level: default_log_level() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Soft sample capacity per metric definition. Only samples past the
    /// metric's retention and every enabled rule window are dropped early
    /// to stay within it; otherwise the buffer grows until purged.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { ring_buffer_size: default_ring_buffer_size() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,
    #[serde(default = "default_retry_batch")]
    pub retry_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_evaluation_interval(),
            retry_interval_secs: default_retry_interval(),
            collection_interval_secs: default_collection_interval(),
            retry_batch_size: default_retry_batch(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Upper bound for a single channel attempt.
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry failed notifications forever, ignoring `max_retries`.
    #[serde(default)]
    pub unbounded_retries: bool,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delivery_timeout(),
            max_retries: default_max_retries(),
            unbounded_retries: false,
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            email: None,
            slack: SlackConfig::default(),
            discord: DiscordConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub smtp_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Used when a rule names a channel (`#ops`) instead of a webhook URL.
    pub webhook_url: Option<String>,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self { enabled: true, webhook_url: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub username: Option<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self { enabled: true, username: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { enabled: true, method: default_post(), headers: HashMap::new() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { broadcast_capacity: default_broadcast_capacity() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Record the engine's own gauges through the ingestion path.
    #[serde(default = "default_true")]
    pub engine_stats: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { engine_stats: true }
    }
}

#[cfg(feature = "nats")]
#[derive(Debug, Deserialize, Clone)]
pub struct NatsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_nats_prefix")]
    pub subject_prefix: String,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub credential_file: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[cfg(feature = "nats")]
impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_nats_url(),
            subject_prefix: default_nats_prefix(),
            compression: false,
            credential_file: None,
            token: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::parse(&content)
    }

    /// Parse configuration text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    });
    Ok(expanded.to_string())
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }
fn default_ring_buffer_size() -> u32 { 8640 }
fn default_evaluation_interval() -> u64 { 60 }
fn default_retry_interval() -> u64 { 30 }
fn default_collection_interval() -> u64 { 30 }
fn default_retry_batch() -> usize { 100 }
fn default_delivery_timeout() -> u64 { 10 }
fn default_max_retries() -> u32 { 5 }
fn default_backoff_base() -> u64 { 30 }
fn default_backoff_max() -> u64 { 1800 }
fn default_smtp_port() -> u16 { 587 }
fn default_post() -> String { "POST".to_string() }
fn default_broadcast_capacity() -> usize { 1024 }
#[cfg(feature = "nats")]
fn default_nats_url() -> String { "nats://localhost:4222".to_string() }
#[cfg(feature = "nats")]
fn default_nats_prefix() -> String { "alertd".to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelKind, MetricKind, Severity};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.scheduler.evaluation_interval_secs, 60);
        assert_eq!(config.scheduler.retry_interval_secs, 30);
        assert_eq!(config.scheduler.collection_interval_secs, 30);
        assert_eq!(config.delivery.max_retries, 5);
        assert!(!config.delivery.unbounded_retries);
        assert!(config.channels.email.is_none());
        assert!(config.channels.slack.enabled);
        assert!(config.metrics.is_empty());
    }

    #[test]
    fn parses_metrics_and_rules() {
        let config = Config::parse(
            r#"
            [engine]
            hostname = "monitor-1"

            [[metrics]]
            name = "cpu.load"
            kind = "gauge"
            unit = "percent"

            [[rules]]
            name = "high_cpu"
            metric = "cpu.load"
            condition = "greater_than"
            threshold = 90
            severity = "critical"
            channels = [{ type = "email", recipient = "ops@example.com" }]

            [[rules]]
            name = "sustained_cpu"
            metric = "cpu.load"
            condition = "avg_5"
            operator = ">="
            threshold = 75.5
            severity = "warning"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.hostname, "monitor-1");
        assert_eq!(config.metrics[0].kind, MetricKind::Gauge);
        assert!(config.metrics[0].enabled);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].severity, Severity::Critical);
        assert_eq!(config.rules[0].channels[0].kind, ChannelKind::Email);
        assert_eq!(config.rules[1].operator.as_deref(), Some(">="));
        assert_eq!(config.rules[1].severity, Severity::Warn);
    }

    #[test]
    fn expands_environment_variables() {
        std::env::set_var("ALERTD_TEST_SMTP_HOST", "smtp.internal");
        let config = Config::parse(
            r#"
            [channels.email]
            smtp_host = "${ALERTD_TEST_SMTP_HOST}"
            from = "alertd@example.com"
            "#,
        )
        .unwrap();
        let email = config.channels.email.unwrap();
        assert_eq!(email.smtp_host, "smtp.internal");
        assert_eq!(email.smtp_port, 587);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[scheduler]\nretry_batch_size = 7\n").unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.scheduler.retry_batch_size, 7);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/alertd.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
