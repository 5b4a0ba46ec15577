use chrono::{DateTime, Duration, Utc};

use crate::condition::{Aggregation, CompareOp};
use crate::storage::Storage;
use super::Verdict;

/// Windowed check over every sample of `metric` with
/// `timestamp >= now - window`. An empty window never fires.
pub fn check_window(
    storage: &Storage,
    metric: &str,
    aggregation: Aggregation,
    window: Duration,
    op: CompareOp,
    threshold: f64,
    now: DateTime<Utc>,
) -> Verdict {
    let Some(cutoff) = now.checked_sub_signed(window) else {
        return Verdict::quiet();
    };

    let values: Vec<f64> = storage.samples_since(metric, cutoff).iter().map(|s| s.value).collect();

    match aggregation.apply(&values) {
        Some(aggregate) => Verdict {
            fire: op.apply(aggregate, threshold),
            observed: Some(aggregate),
        },
        None => Verdict::quiet(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::types::{MetricDefinition, MetricKind};
    use smallvec::smallvec;

    fn storage_with(values: &[(f64, i64)], now: DateTime<Utc>) -> Storage {
        let storage = Storage::new(&StorageConfig::default());
        storage.register_metric(MetricDefinition::new("m", MetricKind::Gauge)).unwrap();
        for (value, mins_ago) in values {
            storage.insert_sample("m", *value, smallvec![], now - Duration::minutes(*mins_ago), None);
        }
        storage
    }

    #[test]
    fn empty_window_is_quiet() {
        let now = Utc::now();
        let storage = storage_with(&[(100.0, 30)], now);
        let verdict = check_window(&storage, "m", Aggregation::Max, Duration::minutes(5), CompareOp::GreaterThan, 1.0, now);
        assert_eq!(verdict, Verdict::quiet());
    }

    #[test]
    fn samples_outside_window_are_ignored() {
        let now = Utc::now();
        let storage = storage_with(&[(100.0, 30), (1.0, 2), (2.0, 1)], now);
        let verdict = check_window(&storage, "m", Aggregation::Sum, Duration::minutes(5), CompareOp::GreaterThan, 2.0, now);
        assert_eq!(verdict, Verdict { fire: true, observed: Some(3.0) });
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let now = Utc::now();
        let storage = storage_with(&[(7.0, 5)], now);
        let verdict = check_window(&storage, "m", Aggregation::Min, Duration::minutes(5), CompareOp::Equal, 7.0, now);
        assert!(verdict.fire);
    }
}
