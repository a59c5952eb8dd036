//! End-to-end query execution tests against the in-memory storage backend.

use promql_stream::engine::{Engine, EngineOpts};
use promql_stream::execution::{self, ExecutionContext, Options};
use promql_stream::logical::{default_optimizers, LogicalPlan};
use promql_stream::storage::{MemStorage, Queryable};
use promql_stream::types::{Labels, QueryValue};
use std::sync::Arc;

const STEP_30S: i64 = 30_000;
const MINUTE: i64 = 60_000;

fn engine() -> Engine {
    Engine::new(EngineOpts::default())
}

fn approx(a: f64, b: f64) {
    assert!((a - b).abs() < 1e-9, "expected {b}, got {a}");
}

fn ten_series_storage() -> Arc<MemStorage> {
    let mut storage = MemStorage::new();
    for i in 0..10 {
        storage.add_series(
            Labels::from_pairs([
                ("__name__".to_string(), "m".to_string()),
                ("i".to_string(), i.to_string()),
            ]),
            vec![(0, i as f64)],
        );
    }
    Arc::new(storage)
}

#[test]
fn instant_sum_over_ten_series() {
    let mut query = engine()
        .new_instant_query(ten_series_storage(), "sum(m)", 0)
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    assert_eq!(result.len(), 1);
    assert!(result[0].metric.is_empty());
    assert_eq!(result[0].point.t, 0);
    approx(result[0].point.v, 45.0);
}

#[test]
fn range_selector_returns_raw_points() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "m")]),
        vec![(0, 1.0), (STEP_30S, 2.0), (MINUTE, 3.0)],
    );
    let mut query = engine()
        .new_range_query(Arc::new(storage), "m", 0, MINUTE, STEP_30S)
        .unwrap();
    let QueryValue::Matrix(result) = query.exec().unwrap() else {
        panic!("expected matrix result");
    };
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].metric.get("__name__"), Some("m"));
    let points: Vec<(i64, f64)> = result[0].points.iter().map(|p| (p.t, p.v)).collect();
    assert_eq!(points, vec![(0, 1.0), (STEP_30S, 2.0), (MINUTE, 3.0)]);
}

#[test]
fn step_invariant_literal_expression() {
    let mut query = engine()
        .new_range_query(Arc::new(MemStorage::new()), "2 * 3", 0, MINUTE, STEP_30S)
        .unwrap();
    let QueryValue::Matrix(result) = query.exec().unwrap() else {
        panic!("expected matrix result");
    };
    assert_eq!(result.len(), 1);
    let points: Vec<(i64, f64)> = result[0].points.iter().map(|p| (p.t, p.v)).collect();
    assert_eq!(points, vec![(0, 6.0), (STEP_30S, 6.0), (MINUTE, 6.0)]);
}

#[test]
fn vector_scalar_division_drops_metric_name() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "m"), ("job", "x")]),
        vec![(0, 10.0), (STEP_30S, 10.0), (MINUTE, 10.0)],
    );
    let mut query = engine()
        .new_range_query(Arc::new(storage), "m / 2", 0, MINUTE, STEP_30S)
        .unwrap();
    let QueryValue::Matrix(result) = query.exec().unwrap() else {
        panic!("expected matrix result");
    };
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].metric.get("__name__"), None);
    assert_eq!(result[0].metric.get("job"), Some("x"));
    assert_eq!(result[0].points.len(), 3);
    for p in &result[0].points {
        approx(p.v, 5.0);
    }
}

#[test]
fn sum_by_pod_of_rate_over_counters() {
    // Two pods, three containers each, counters increasing 1/s.
    let mut storage = MemStorage::new();
    for pod in ["a", "b"] {
        for container in ["c0", "c1", "c2"] {
            storage.add_series(
                Labels::from_pairs([
                    ("__name__", "http_requests_total"),
                    ("pod", pod),
                    ("container", container),
                ]),
                (0..=12).map(|i| (i * 15_000, (i * 15) as f64)).collect(),
            );
        }
    }
    let mut query = engine()
        .new_range_query(
            Arc::new(storage),
            "sum by (pod) (rate(http_requests_total[1m]))",
            MINUTE,
            3 * MINUTE,
            STEP_30S,
        )
        .unwrap();
    let QueryValue::Matrix(result) = query.exec().unwrap() else {
        panic!("expected matrix result");
    };
    assert_eq!(result.len(), 2);
    for series in &result {
        assert!(series.metric.get("pod").is_some());
        assert_eq!(series.metric.len(), 1);
        assert_eq!(series.points.len(), 5);
        for p in &series.points {
            approx(p.v, 3.0);
        }
    }
}

#[test]
fn cancelled_query_returns_cancellation_error() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "m")]),
        (0..10_000).map(|i| (i * 1000, i as f64)).collect(),
    );
    let mut query = engine()
        .new_range_query(Arc::new(storage), "sum(m)", 0, 10_000_000, 1000)
        .unwrap();
    query.cancel();
    let err = query.exec().unwrap_err();
    assert!(matches!(
        err,
        promql_stream::EngineError::Canceled
    ));
}

#[test]
fn cancellation_from_another_thread() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "m")]),
        (0..1000).map(|i| (i * 1000, i as f64)).collect(),
    );
    // A very long range keeps the query busy until the cancel lands.
    let mut query = engine()
        .new_range_query(Arc::new(storage), "sum(m)", 0, 20_000_000_000, 1000)
        .unwrap();
    let handle = query.cancel_handle();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        handle.cancel();
    });
    let err = query.exec().unwrap_err();
    assert!(matches!(err, promql_stream::EngineError::Canceled));
    canceller.join().unwrap();
}

#[test]
fn instant_vector_timestamps_forced_to_evaluation_time() {
    let mut storage = MemStorage::new();
    // Latest sample is older than the evaluation timestamp but inside the
    // lookback window.
    storage.add_series(Labels::from_pairs([("__name__", "m")]), vec![(0, 7.0)]);
    let mut query = engine()
        .new_instant_query(Arc::new(storage), "m", 90_000)
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    assert_eq!(result[0].point.t, 90_000);
    approx(result[0].point.v, 7.0);
}

#[test]
fn scalar_function_collapses_single_series() {
    let mut storage = MemStorage::new();
    storage.add_series(Labels::from_pairs([("__name__", "m")]), vec![(0, 42.0)]);
    let mut query = engine()
        .new_instant_query(Arc::new(storage), "scalar(m)", 0)
        .unwrap();
    let QueryValue::Scalar(point) = query.exec().unwrap() else {
        panic!("expected scalar result");
    };
    approx(point.v, 42.0);
}

#[test]
fn scalar_function_is_nan_for_multiple_series() {
    let mut query = engine()
        .new_instant_query(ten_series_storage(), "scalar(m)", 0)
        .unwrap();
    let QueryValue::Scalar(point) = query.exec().unwrap() else {
        panic!("expected scalar result");
    };
    assert!(point.v.is_nan());
}

#[test]
fn quantile_aggregation() {
    let mut query = engine()
        .new_instant_query(ten_series_storage(), "quantile(0.5, m)", 0)
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    assert_eq!(result.len(), 1);
    approx(result[0].point.v, 4.5);
}

#[test]
fn topk_returns_original_series() {
    let mut query = engine()
        .new_instant_query(ten_series_storage(), "topk(2, m)", 0)
        .unwrap();
    let QueryValue::Vector(mut result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    result.sort_by(|a, b| a.point.v.partial_cmp(&b.point.v).unwrap());
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].metric.get("i"), Some("8"));
    approx(result[0].point.v, 8.0);
    assert_eq!(result[1].metric.get("i"), Some("9"));
    approx(result[1].point.v, 9.0);
}

#[test]
fn vector_matching_one_to_one() {
    let mut storage = MemStorage::new();
    for (job, requests, limit) in [("x", 30.0, 10.0), ("y", 80.0, 20.0)] {
        storage.add_series(
            Labels::from_pairs([("__name__", "requests"), ("job", job)]),
            vec![(0, requests)],
        );
        storage.add_series(
            Labels::from_pairs([("__name__", "limit"), ("job", job)]),
            vec![(0, limit)],
        );
    }
    let mut query = engine()
        .new_instant_query(Arc::new(storage), "requests / limit", 0)
        .unwrap();
    let QueryValue::Vector(mut result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    result.sort_by(|a, b| a.metric.cmp(&b.metric));
    assert_eq!(result.len(), 2);
    approx(result[0].point.v, 3.0);
    approx(result[1].point.v, 4.0);
    assert!(result.iter().all(|s| s.metric.get("__name__").is_none()));
}

#[test]
fn duplicate_vector_match_fails_at_execution() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "a"), ("job", "x")]),
        vec![(0, 1.0)],
    );
    for id in ["1", "2"] {
        storage.add_series(
            Labels::from_pairs([("__name__", "b"), ("job", "x"), ("id", id)]),
            vec![(0, 2.0)],
        );
    }
    let mut query = engine()
        .new_instant_query(Arc::new(storage), "a + on(job) b", 0)
        .unwrap();
    let err = query.exec().unwrap_err();
    assert!(matches!(
        err,
        promql_stream::EngineError::DuplicateMatch(_)
    ));
}

#[test]
fn comparison_filters_series() {
    let mut query = engine()
        .new_instant_query(ten_series_storage(), "m > 6", 0)
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    // Values 7, 8, 9 survive; the scalar operation strips the metric name.
    assert_eq!(result.len(), 3);
    assert!(result.iter().all(|s| s.metric.get("__name__").is_none()));
}

#[test]
fn at_modifier_pins_evaluation_time() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "m")]),
        vec![(0, 1.0), (STEP_30S, 2.0), (2 * MINUTE, 9.0)],
    );
    let mut query = engine()
        .new_range_query(Arc::new(storage), "m @ 30", 0, 2 * MINUTE, MINUTE)
        .unwrap();
    let QueryValue::Matrix(result) = query.exec().unwrap() else {
        panic!("expected matrix result");
    };
    // Every step replays the value read at t=30s.
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].points.len(), 3);
    for p in &result[0].points {
        approx(p.v, 2.0);
    }
}

#[test]
fn subquery_feeds_range_function() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "m")]),
        (0..=4).map(|i| (i * 15_000, 2.0)).collect(),
    );
    let mut query = engine()
        .new_instant_query(Arc::new(storage), "sum_over_time(m[1m:15s])", MINUTE)
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    assert_eq!(result.len(), 1);
    // Inner evaluations at 15s, 30s, 45s and 60s each see the value 2.
    approx(result[0].point.v, 8.0);
}

#[test]
fn merged_selectors_share_one_read_and_stay_correct() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "a"), ("job", "x")]),
        vec![(0, 10.0)],
    );
    storage.add_series(
        Labels::from_pairs([("__name__", "a"), ("job", "x"), ("handler", "y")]),
        vec![(0, 30.0)],
    );
    let mut query = engine()
        .new_instant_query(
            Arc::new(storage),
            r#"sum(a) / sum(a{handler="y"})"#,
            0,
        )
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    assert_eq!(result.len(), 1);
    approx(result[0].point.v, 40.0 / 30.0);
}

#[test]
fn stddev_of_constant_series_is_exactly_zero() {
    let mut storage = MemStorage::new();
    for i in 0..5 {
        storage.add_series(
            Labels::from_pairs([
                ("__name__".to_string(), "m".to_string()),
                ("i".to_string(), i.to_string()),
            ]),
            vec![(0, 12.5)],
        );
    }
    let storage: Arc<dyn Queryable> = Arc::new(storage);
    for q in ["stddev(m)", "stdvar(m)"] {
        let mut query = engine().new_instant_query(Arc::clone(&storage), q, 0).unwrap();
        let QueryValue::Vector(result) = query.exec().unwrap() else {
            panic!("expected vector result");
        };
        assert_eq!(result[0].point.v, 0.0, "{q}");
    }
}

#[test]
fn increase_over_counter_with_reset() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "c")]),
        vec![(0, 5.0), (20_000, 8.0), (40_000, 2.0), (MINUTE, 4.0)],
    );
    let mut query = engine()
        .new_instant_query(Arc::new(storage), "increase(c[1m])", MINUTE)
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    // Window (0, 60]: samples 8, 2, 4 with one reset: (4 - 8) + 8 = 4, then
    // extrapolated to the window edges.
    assert_eq!(result.len(), 1);
    assert!(result[0].point.v > 4.0 && result[0].point.v < 7.0);
}

#[test]
fn pool_buffers_balanced_after_manual_execution() {
    // Drive an operator tree by hand and verify every borrowed buffer is
    // returned by the end of the stream.
    let expr = promql_parser::parser::parse("sum by (i) (m) / 2").unwrap();
    let mut plan = LogicalPlan::new(expr, 0, MINUTE).unwrap();
    plan.optimize(&default_optimizers());
    let opts = Options {
        start: 0,
        end: MINUTE,
        step: STEP_30S,
        lookback_delta: 5 * MINUTE,
        default_subquery_step: MINUTE,
    };
    let mut op = execution::build(&plan, ten_series_storage(), &opts).unwrap();

    let ctx = ExecutionContext::new();
    let _series = op.series(&ctx).unwrap();
    while let Some(batch) = op.next(&ctx).unwrap() {
        op.pool().put_vectors(batch);
    }
    assert_eq!(op.pool().outstanding(), 0);
}

#[test]
fn empty_selection_yields_empty_result() {
    let mut query = engine()
        .new_range_query(
            ten_series_storage(),
            r#"nonexistent_metric"#,
            0,
            MINUTE,
            STEP_30S,
        )
        .unwrap();
    let QueryValue::Matrix(result) = query.exec().unwrap() else {
        panic!("expected matrix result");
    };
    assert!(result.is_empty());
}

#[test]
fn offset_shifts_the_evaluation_window() {
    let mut storage = MemStorage::new();
    storage.add_series(
        Labels::from_pairs([("__name__", "m")]),
        vec![(0, 1.0), (MINUTE, 2.0)],
    );
    let mut query = engine()
        .new_instant_query(Arc::new(storage), "m offset 1m", MINUTE)
        .unwrap();
    let QueryValue::Vector(result) = query.exec().unwrap() else {
        panic!("expected vector result");
    };
    approx(result[0].point.v, 1.0);
}
