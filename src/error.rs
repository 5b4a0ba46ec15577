use crate::types::{AlertStatus, InstanceId, NotificationId, RuleId};

/// Errors surfaced synchronously by the engine.
///
/// Delivery failures are not part of this enum: they are recorded on the
/// notification (see [`crate::alerter::DeliveryError`]) and never reach the
/// code path that triggered the alert.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Ingest referenced a metric that is not registered or is disabled.
    #[error("unknown or disabled metric '{0}'")]
    UnknownMetric(String),

    #[error("metric '{0}' is already registered")]
    DuplicateMetric(String),

    /// The sample does not fit its metric definition.
    #[error("invalid sample for '{metric}': {reason}")]
    InvalidSample { metric: String, reason: String },

    /// Malformed condition, aggregation keyword, operator or window.
    #[error("invalid rule condition: {0}")]
    InvalidRuleCondition(String),

    #[error("unknown alert rule {0}")]
    UnknownRule(RuleId),

    #[error("unknown alert instance {0}")]
    UnknownInstance(InstanceId),

    #[error("cannot {action} alert {id}: status is {from}")]
    InvalidTransition {
        id: InstanceId,
        from: AlertStatus,
        action: &'static str,
    },

    #[error("unknown notification {0}")]
    UnknownNotification(NotificationId),
}

pub type Result<T> = std::result::Result<T, EngineError>;
