use crate::condition::CompareOp;
use crate::types::MetricValue;
use super::Verdict;

/// Instant check: compares a single sample against the threshold.
/// No history is consulted.
pub fn check_sample(sample: &MetricValue, op: CompareOp, threshold: f64) -> Verdict {
    Verdict {
        fire: op.apply(sample.value, threshold),
        observed: Some(sample.value),
    }
}
