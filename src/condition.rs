//! Rule condition expressions.
//!
//! Conditions arrive as keywords (`greater_than`, `avg_15`, ...) and are
//! parsed once when the rule is stored. Evaluation only ever sees the
//! parsed [`Condition`].

use chrono::Duration;
use serde::Serialize;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Comparison between an observed value and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompareOp {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl CompareOp {
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::GreaterThan => value > threshold,
            CompareOp::GreaterOrEqual => value >= threshold,
            CompareOp::LessThan => value < threshold,
            CompareOp::LessOrEqual => value <= threshold,
            CompareOp::Equal => value == threshold,
            CompareOp::NotEqual => value != threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterOrEqual => ">=",
            CompareOp::LessThan => "<",
            CompareOp::LessOrEqual => "<=",
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
        }
    }

    /// Instant-mode condition keywords.
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "greater_than" => Some(CompareOp::GreaterThan),
            "greater_or_equal" => Some(CompareOp::GreaterOrEqual),
            "less_than" => Some(CompareOp::LessThan),
            "less_or_equal" => Some(CompareOp::LessOrEqual),
            "equals" => Some(CompareOp::Equal),
            "not_equals" => Some(CompareOp::NotEqual),
            _ => None,
        }
    }
}

impl FromStr for CompareOp {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            ">" | "gt" => Ok(CompareOp::GreaterThan),
            ">=" | "gte" => Ok(CompareOp::GreaterOrEqual),
            "<" | "lt" => Ok(CompareOp::LessThan),
            "<=" | "lte" => Ok(CompareOp::LessOrEqual),
            "==" | "=" | "eq" => Ok(CompareOp::Equal),
            "!=" | "ne" => Ok(CompareOp::NotEqual),
            other => Err(EngineError::InvalidRuleCondition(format!("unknown operator '{other}'"))),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Numeric summary computed over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Aggregation {
    Avg,
    Sum,
    Max,
    Min,
}

impl Aggregation {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "avg" => Some(Aggregation::Avg),
            "sum" => Some(Aggregation::Sum),
            "max" => Some(Aggregation::Max),
            "min" => Some(Aggregation::Min),
            _ => None,
        }
    }

    /// Returns `None` for an empty input.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let result = match self {
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        };
        Some(result)
    }

    pub fn name(self) -> &'static str {
        match self {
            Aggregation::Avg => "avg",
            Aggregation::Sum => "sum",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
        }
    }
}

/// Parsed rule condition: exactly one of the two evaluation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Condition {
    /// Compare the latest sample against the threshold.
    Instant { op: CompareOp },
    /// Aggregate every sample in the trailing window, then compare.
    Windowed {
        aggregation: Aggregation,
        window_minutes: u32,
        op: CompareOp,
    },
}

impl Condition {
    /// Parse a condition keyword.
    ///
    /// `operator` only applies to windowed forms and defaults to `>`.
    /// `window_minutes` supplies the window for a bare aggregation keyword
    /// such as `avg`; an explicit `avg_N` suffix takes precedence.
    pub fn parse(expr: &str, operator: Option<&str>, window_minutes: Option<u32>) -> Result<Self> {
        let keyword = expr.trim().to_ascii_lowercase();

        if let Some(op) = CompareOp::from_keyword(&keyword) {
            return Ok(Condition::Instant { op });
        }

        let (agg, window) = match keyword.split_once('_') {
            Some((agg, n)) => {
                let minutes = n.parse::<u32>().map_err(|_| {
                    EngineError::InvalidRuleCondition(format!("bad window length in '{expr}'"))
                })?;
                (agg, Some(minutes))
            }
            None => (keyword.as_str(), window_minutes),
        };

        let aggregation = Aggregation::from_keyword(agg)
            .ok_or_else(|| EngineError::InvalidRuleCondition(format!("unknown condition '{expr}'")))?;

        let window_minutes = match window {
            Some(m) if m > 0 => m,
            _ => {
                return Err(EngineError::InvalidRuleCondition(format!(
                    "windowed condition '{expr}' needs a positive window length"
                )))
            }
        };

        let op = operator.map(str::parse).transpose()?.unwrap_or(CompareOp::GreaterThan);

        Ok(Condition::Windowed { aggregation, window_minutes, op })
    }

    pub fn op(&self) -> CompareOp {
        match self {
            Condition::Instant { op } | Condition::Windowed { op, .. } => *op,
        }
    }

    pub fn is_windowed(&self) -> bool {
        matches!(self, Condition::Windowed { .. })
    }

    pub fn window(&self) -> Option<Duration> {
        match self {
            Condition::Instant { .. } => None,
            Condition::Windowed { window_minutes, .. } => Some(Duration::minutes(i64::from(*window_minutes))),
        }
    }

    /// Human-readable subject of the comparison, e.g. `avg(cpu.load) over 5m`.
    pub fn describe(&self, metric: &str) -> String {
        match self {
            Condition::Instant { .. } => metric.to_string(),
            Condition::Windowed { aggregation, window_minutes, .. } => {
                format!("{}({}) over {}m", aggregation.name(), metric, window_minutes)
            }
        }
    }
}
