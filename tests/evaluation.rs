mod common;

use chrono::{Duration, Utc};
use smallvec::SmallVec;

use alertd::config::StorageConfig;
use alertd::error::EngineError;
use alertd::ingest::Observation;
use alertd::storage::Storage;
use alertd::types::{ChannelKind, MetricDefinition, MetricKind, RuleSpec};
use alertd::EngineBuilder;
use common::{engine_with, gauge, RecordingChannel};

#[tokio::test]
async fn windowed_average_crosses_threshold_on_sixth_sample() {
    let engine = engine_with(&[]);
    gauge(&engine, "queue.depth");
    let rule = engine
        .storage
        .create_rule(RuleSpec::new("deep_queue", "queue.depth", "avg_5", 3.0))
        .unwrap();

    let now = Utc::now();
    for (i, value) in [1.0, 2.0, 3.0, 4.0, 5.0].into_iter().enumerate() {
        let at = now - Duration::minutes(4 - i as i64);
        engine.ingestor.record_observation(Observation::new("queue.depth", value).at(at)).await.unwrap();
    }

    let verdict = engine.evaluator.evaluate_at(&rule, None, now).unwrap();
    assert!(!verdict.fire);
    assert_eq!(verdict.observed, Some(3.0));
    assert!(engine.storage.instances_for_rule(rule.id).is_empty());

    engine.ingestor.record_observation(Observation::new("queue.depth", 10.0).at(now)).await.unwrap();

    let verdict = engine.evaluator.evaluate_at(&rule, None, now).unwrap();
    assert!(verdict.fire);
    let instances = engine.storage.instances_for_rule(rule.id);
    assert_eq!(instances.len(), 1);
    assert!((instances[0].triggered_value - 25.0 / 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn small_sample_capacity_keeps_the_whole_window() {
    let engine = EngineBuilder::new(Storage::new(&StorageConfig { ring_buffer_size: 3 })).build();
    gauge(&engine, "queue.depth");
    let rule = engine
        .storage
        .create_rule(RuleSpec::new("deep_queue", "queue.depth", "avg_5", 3.0))
        .unwrap();

    let now = Utc::now();
    for (i, value) in [1.0, 2.0, 3.0, 4.0, 5.0].into_iter().enumerate() {
        let at = now - Duration::minutes(4 - i as i64);
        engine.ingestor.record_observation(Observation::new("queue.depth", value).at(at)).await.unwrap();
    }

    assert_eq!(engine.storage.sample_count("queue.depth"), 5);
    let verdict = engine.evaluator.evaluate_at(&rule, None, now).unwrap();
    assert!(!verdict.fire);
    assert_eq!(verdict.observed, Some(3.0));
    assert!(engine.storage.instances_for_rule(rule.id).is_empty());
}

#[tokio::test]
async fn windowed_rule_with_no_samples_never_fires() {
    let engine = engine_with(&[]);
    gauge(&engine, "queue.depth");
    let rule = engine
        .storage
        .create_rule(RuleSpec::new("quiet_queue", "queue.depth", "max_10", 0.0).operator(">="))
        .unwrap();

    let verdict = engine.evaluator.evaluate_at(&rule, None, Utc::now()).unwrap();
    assert!(!verdict.fire);
    assert_eq!(verdict.observed, None);

    let report = engine.evaluator.evaluate_all().await;
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.fired, 0);
}

#[tokio::test]
async fn sweep_fires_windowed_rules_and_stamps_evaluation_time() {
    let engine = engine_with(&[]);
    gauge(&engine, "disk.used");
    gauge(&engine, "mem.used");

    let instant = engine
        .storage
        .create_rule(RuleSpec::new("disk_full", "disk.used", "greater_than", 95.0))
        .unwrap();
    let windowed = engine
        .storage
        .create_rule(RuleSpec::new("mem_pressure", "mem.used", "min", 50.0).window_minutes(10))
        .unwrap();

    // Stored directly so no ingest-time evaluation happens.
    let at = Utc::now() - Duration::minutes(1);
    engine.storage.insert_sample("mem.used", 80.0, SmallVec::new(), at, None);

    let before = Utc::now();
    let report = engine.evaluator.evaluate_all().await;

    assert_eq!(report.evaluated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.fired, 1);
    assert_eq!(report.created, 1);

    let windowed = engine.storage.rule(windowed.id).unwrap();
    assert!(windowed.last_evaluation.is_some_and(|t| t >= before));
    assert!(windowed.last_triggered.is_some());

    let instant = engine.storage.rule(instant.id).unwrap();
    assert!(instant.last_evaluation.is_some_and(|t| t >= before));
    assert!(instant.last_triggered.is_none());

    // A second sweep finds the active instance and creates nothing.
    let report = engine.evaluator.evaluate_all().await;
    assert_eq!(report.fired, 1);
    assert_eq!(report.created, 0);
}

#[tokio::test]
async fn sweep_skips_rules_on_disabled_metrics() {
    let engine = engine_with(&[]);
    gauge(&engine, "disk.used");
    let rule = engine
        .storage
        .create_rule(RuleSpec::new("disk_full", "disk.used", "greater_than", 95.0))
        .unwrap();
    engine.storage.insert_sample("disk.used", 99.0, SmallVec::new(), Utc::now(), None);
    engine.storage.set_metric_enabled("disk.used", false).unwrap();

    let report = engine.evaluator.evaluate_all().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.evaluated, 0);
    assert!(engine.storage.instances(None).is_empty());
    assert!(engine.storage.rule(rule.id).unwrap().last_evaluation.is_some());
}

#[tokio::test]
async fn unknown_and_disabled_metrics_are_rejected_on_ingest() {
    let engine = engine_with(&[]);
    let err = engine.ingestor.record("nope", 1.0, SmallVec::new(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownMetric(ref name) if name == "nope"));

    gauge(&engine, "cpu.load");
    engine.storage.set_metric_enabled("cpu.load", false).unwrap();
    let err = engine.ingestor.record("cpu.load", 1.0, SmallVec::new(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownMetric(_)));
    assert_eq!(engine.storage.sample_count("cpu.load"), 0);
}

#[tokio::test]
async fn invalid_samples_are_not_stored() {
    let engine = engine_with(&[]);
    engine
        .storage
        .register_metric(MetricDefinition::new("http.latency", MetricKind::Timer).with_label_keys(["route"]))
        .unwrap();

    let err = engine.ingestor.record("http.latency", f64::NAN, SmallVec::new(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSample { .. }));

    let err = engine
        .ingestor
        .record_observation(Observation::new("http.latency", 12.0).label("host", "a"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSample { .. }));

    let err = engine
        .ingestor
        .record_observation(Observation::new("http.latency", 12.0).label("route", "/a").label("route", "/b"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSample { .. }));

    engine
        .ingestor
        .record_observation(Observation::new("http.latency", 12.0).label("route", "/api"))
        .await
        .unwrap();
    assert_eq!(engine.storage.sample_count("http.latency"), 1);
}

#[tokio::test]
async fn rule_that_holds_on_ingest_creates_one_instance() {
    let email = RecordingChannel::new(ChannelKind::Email);
    let engine = engine_with(&[email.clone()]);
    gauge(&engine, "cpu.load");
    let rule = engine
        .storage
        .create_rule(RuleSpec::new("high_cpu", "cpu.load", "greater_than", 90.0).channel(ChannelKind::Email, "ops@example.com"))
        .unwrap();

    engine.ingestor.record("cpu.load", 50.0, SmallVec::new(), None).await.unwrap();
    assert!(engine.storage.instances_for_rule(rule.id).is_empty());
    assert!(engine.storage.rule(rule.id).unwrap().last_evaluation.is_some());

    for value in [95.0, 97.0, 99.0] {
        engine.ingestor.record("cpu.load", value, SmallVec::new(), None).await.unwrap();
    }

    let instances = engine.storage.instances_for_rule(rule.id);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].triggered_value, 95.0);
    assert_eq!(email.sent().len(), 1);
}

#[tokio::test]
async fn invalid_rule_conditions_are_rejected() {
    let engine = engine_with(&[]);
    gauge(&engine, "cpu.load");

    for condition in ["sideways", "avg_x", "avg", "median_5"] {
        let err = engine
            .storage
            .create_rule(RuleSpec::new("bad", "cpu.load", condition, 1.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRuleCondition(_)), "{condition}");
    }
}
