use parking_lot::Mutex;

use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValueList, any_value};
use opentelemetry_proto::tonic::metrics::v1::{
    ExponentialHistogram, ExponentialHistogramDataPoint, Gauge, Histogram, HistogramDataPoint,
    NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum, Summary, SummaryDataPoint,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};

use super::*;
use crate::domain::limiter::LimiterConfig;
use crate::domain::normalizer::NormalizerConfig;
use crate::domain::resolver::ResolverConfig;
use crate::domain::rules::RuleConfig;
use crate::utils::otlp::{get_str, keys, make_str_attr};

// ============================================================================
// FIXTURES
// ============================================================================

fn attrs(pairs: &[(&str, &str)]) -> Vec<KeyValue> {
    pairs.iter().map(|(k, v)| make_str_attr(k, *v)).collect()
}

fn stages(resolvers: &str, rules: &str, lowercase: &[&str]) -> PipelineStages {
    let resolvers: Vec<ResolverConfig> = serde_json::from_str(resolvers).unwrap();
    let rules: Vec<RuleConfig> = serde_json::from_str(rules).unwrap();
    PipelineStages {
        resolver: Arc::new(AttributesResolver::new(&resolvers)),
        normalizer: Arc::new(
            AttributesNormalizer::new(&NormalizerConfig {
                lowercase_keys: lowercase.iter().map(|k| k.to_string()).collect(),
                ..Default::default()
            })
            .unwrap(),
        ),
        rules: Arc::new(RuleSet::compile(&rules).unwrap()),
    }
}

const CHECKOUT_RESOLVER: &str = r#"[{"kind": "endpoint", "entries": {"10.0.0.5": "CheckOut"}}]"#;
const KEEP_CHECKOUT: &str =
    r#"[{"selectors": [{"dimension": "service", "match": "checkout"}], "action": "keep"}]"#;

fn limiter(max_series: usize, on_limit: LimitPolicy) -> Arc<MetricsLimiter> {
    Arc::new(MetricsLimiter::new(&LimiterConfig {
        max_series,
        on_limit,
        ..Default::default()
    }))
}

fn number_points(points: &[&[(&str, &str)]]) -> Vec<NumberDataPoint> {
    points
        .iter()
        .map(|p| NumberDataPoint {
            attributes: attrs(p),
            ..Default::default()
        })
        .collect()
}

fn metric(name: &str, data: Data) -> Metric {
    Metric {
        name: name.to_string(),
        data: Some(data),
        ..Default::default()
    }
}

fn gauge(name: &str, points: &[&[(&str, &str)]]) -> Metric {
    metric(
        name,
        Data::Gauge(Gauge {
            data_points: number_points(points),
        }),
    )
}

fn metrics_request(resource: &[(&str, &str)], metrics: Vec<Metric>) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(Resource {
                attributes: attrs(resource),
                ..Default::default()
            }),
            scope_metrics: vec![ScopeMetrics {
                metrics,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn traces_request(spans: Vec<Span>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: attrs(&[("service.name", "frontend")]),
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn metrics_of(batch: &ExportMetricsServiceRequest) -> &[Metric] {
    &batch.resource_metrics[0].scope_metrics[0].metrics
}

fn gauge_points(metric: &Metric) -> &[NumberDataPoint] {
    match &metric.data {
        Some(Data::Gauge(g)) => &g.data_points,
        other => panic!("expected gauge, got {:?}", other),
    }
}

#[derive(Default)]
struct RecordingReporter {
    failures: Mutex<Vec<&'static str>>,
    drops: Mutex<Vec<(&'static str, String)>>,
    rejections: Mutex<Vec<String>>,
    batches: Mutex<Vec<BatchStats>>,
}

impl Reporter for RecordingReporter {
    fn stage_failed(&self, stage: &'static str, _kind: RecordKind, _error: &PipelineError) {
        self.failures.lock().push(stage);
    }

    fn record_dropped(&self, stage: &'static str, metric_name: &str) {
        self.drops.lock().push((stage, metric_name.to_string()));
    }

    fn series_rejected(&self, metric_name: &str, _policy: LimitPolicy) {
        self.rejections.lock().push(metric_name.to_string());
    }

    fn batch_processed(&self, _kind: RecordKind, stats: &BatchStats) {
        self.batches.lock().push(*stats);
    }
}

// ============================================================================
// END TO END
// ============================================================================

#[test]
fn test_gauge_end_to_end_scenario() {
    let pipeline = Pipeline::for_metrics(
        stages(CHECKOUT_RESOLVER, KEEP_CHECKOUT, &["service"]),
        None,
        MetricNameCase::Preserve,
    );
    let request = metrics_request(
        &[],
        vec![gauge(
            "latency",
            &[&[("ip", "10.0.0.5")], &[("service", "unknown")]],
        )],
    );

    let result = pipeline.process_metrics(request);
    let points = gauge_points(&metrics_of(&result.batch)[0]);

    assert_eq!(points.len(), 1);
    assert_eq!(get_str(&points[0].attributes, "service"), Some("checkout"));
    assert_eq!(get_str(&points[0].attributes, "ip"), Some("10.0.0.5"));
    assert!(result.errors.is_empty());
    assert_eq!(result.stats.seen, 2);
    assert_eq!(result.stats.dropped_by_rules, 1);
    assert_eq!(result.stats.retained(), 1);
}

#[test]
fn test_all_metric_kinds_share_the_traversal() {
    let pipeline = Pipeline::for_metrics(
        stages("[]", KEEP_CHECKOUT, &[]),
        None,
        MetricNameCase::Preserve,
    );
    let keep = attrs(&[("service", "checkout")]);
    let other = attrs(&[("service", "other")]);

    let metrics = vec![
        gauge("g", &[&[("service", "checkout")], &[("service", "other")]]),
        metric(
            "s",
            Data::Sum(Sum {
                data_points: number_points(&[&[("service", "other")], &[("service", "checkout")]]),
                ..Default::default()
            }),
        ),
        metric(
            "h",
            Data::Histogram(Histogram {
                data_points: vec![
                    HistogramDataPoint {
                        attributes: keep.clone(),
                        ..Default::default()
                    },
                    HistogramDataPoint {
                        attributes: other.clone(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
        ),
        metric(
            "eh",
            Data::ExponentialHistogram(ExponentialHistogram {
                data_points: vec![
                    ExponentialHistogramDataPoint {
                        attributes: other.clone(),
                        ..Default::default()
                    },
                    ExponentialHistogramDataPoint {
                        attributes: keep.clone(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
        ),
        metric(
            "sm",
            Data::Summary(Summary {
                data_points: vec![
                    SummaryDataPoint {
                        attributes: keep.clone(),
                        ..Default::default()
                    },
                    SummaryDataPoint {
                        attributes: other,
                        ..Default::default()
                    },
                ],
            }),
        ),
    ];

    let result = pipeline.process_metrics(metrics_request(&[], metrics));
    assert_eq!(result.stats.seen, 10);
    assert_eq!(result.stats.dropped_by_rules, 5);

    for m in metrics_of(&result.batch) {
        let remaining: Vec<&[KeyValue]> = match m.data.as_ref().unwrap() {
            Data::Gauge(g) => g.data_points.iter().map(|p| p.attributes()).collect(),
            Data::Sum(s) => s.data_points.iter().map(|p| p.attributes()).collect(),
            Data::Histogram(h) => h.data_points.iter().map(|p| p.attributes()).collect(),
            Data::ExponentialHistogram(eh) => {
                eh.data_points.iter().map(|p| p.attributes()).collect()
            }
            Data::Summary(s) => s.data_points.iter().map(|p| p.attributes()).collect(),
        };
        assert_eq!(remaining, vec![keep.as_slice()], "metric {}", m.name);
    }
}

#[test]
fn test_retained_order_is_stable() {
    let pipeline = Pipeline::for_metrics(
        stages(
            "[]",
            r#"[{"selectors": [{"dimension": "drop", "match": "yes"}], "action": "drop"}]"#,
            &[],
        ),
        None,
        MetricNameCase::Preserve,
    );
    let request = metrics_request(
        &[],
        vec![gauge(
            "g",
            &[
                &[("n", "1")],
                &[("n", "2"), ("drop", "yes")],
                &[("n", "3"), ("drop", "yes")],
                &[("n", "4")],
                &[("n", "5")],
            ],
        )],
    );

    let result = pipeline.process_metrics(request);
    let order: Vec<_> = gauge_points(&metrics_of(&result.batch)[0])
        .iter()
        .map(|p| get_str(&p.attributes, "n").unwrap().to_string())
        .collect();
    assert_eq!(order, vec!["1", "4", "5"]);
}

#[test]
fn test_replacer_runs_after_rules_and_sees_resolved_values() {
    let rules = r#"[
        {"selectors": [{"dimension": "service", "match": "checkout"}], "action": "keep"},
        {"selectors": [{"dimension": "service", "match": "checkout"}], "action": "replace",
         "replacements": [{"target_dimension": "tier", "value": "gold"}]}
    ]"#;
    let pipeline = Pipeline::for_metrics(
        stages(CHECKOUT_RESOLVER, rules, &["service"]),
        None,
        MetricNameCase::Preserve,
    );
    let result = pipeline.process_metrics(metrics_request(
        &[],
        vec![gauge("g", &[&[("ip", "10.0.0.5"), ("tier", "bronze")], &[("ip", "10.0.0.5")]])],
    ));
    let points = gauge_points(&metrics_of(&result.batch)[0]);
    assert_eq!(get_str(&points[0].attributes, "tier"), Some("gold"));
    // No tier to overwrite, none added
    assert_eq!(get_str(&points[1].attributes, "service"), Some("checkout"));
    assert_eq!(get_str(&points[1].attributes, "tier"), None);
}

#[test]
fn test_metric_name_title_case() {
    let pipeline = Pipeline::for_metrics(stages("[]", "[]", &[]), None, MetricNameCase::Title);
    let result = pipeline.process_metrics(metrics_request(
        &[],
        vec![gauge("request latency", &[&[("a", "b")]])],
    ));
    assert_eq!(metrics_of(&result.batch)[0].name, "Request Latency");
}

#[test]
fn test_resource_attributes_reach_resolvers_by_reference() {
    let pipeline = Pipeline::for_metrics(
        stages(r#"[{"kind": "environment"}]"#, "[]", &[]),
        None,
        MetricNameCase::Preserve,
    );
    let result = pipeline.process_metrics(metrics_request(
        &[(keys::DEPLOYMENT_ENV, "production")],
        vec![gauge("g", &[&[("a", "b")]])],
    ));
    let points = gauge_points(&metrics_of(&result.batch)[0]);
    assert_eq!(
        get_str(&points[0].attributes, keys::DEPLOYMENT_ENV),
        Some("production")
    );
    let resource = result.batch.resource_metrics[0].resource.as_ref().unwrap();
    assert_eq!(resource.attributes.len(), 1);
}

#[test]
fn test_metric_without_data_is_left_alone() {
    let pipeline = Pipeline::for_metrics(stages("[]", KEEP_CHECKOUT, &[]), None, MetricNameCase::Preserve);
    let empty = Metric {
        name: "empty".to_string(),
        ..Default::default()
    };
    let result = pipeline.process_metrics(metrics_request(&[], vec![empty]));
    assert_eq!(result.stats.seen, 0);
    assert_eq!(metrics_of(&result.batch).len(), 1);
}

// ============================================================================
// ERRORS
// ============================================================================

fn kvlist_attr(key: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::KvlistValue(KeyValueList { values: vec![] })),
        }),
    }
}

#[test]
fn test_stage_errors_are_collected_and_record_continues() {
    let rules = r#"[
        {"selectors": [{"dimension": "payload", "match": "*"}], "action": "drop"},
        {"selectors": [{"dimension": "service", "match": "*"}], "action": "replace",
         "replacements": [{"target_dimension": "seen", "value": "yes"}]}
    ]"#;
    let reporter = Arc::new(RecordingReporter::default());
    let pipeline = Pipeline::for_metrics(stages("[]", rules, &[]), None, MetricNameCase::Preserve)
        .with_reporter(reporter.clone());

    let mut point_attrs = attrs(&[("service", "checkout"), ("seen", "no")]);
    point_attrs.push(kvlist_attr("payload"));
    let request = metrics_request(
        &[],
        vec![metric(
            "g",
            Data::Gauge(Gauge {
                data_points: vec![NumberDataPoint {
                    attributes: point_attrs,
                    ..Default::default()
                }],
            }),
        )],
    );

    let result = pipeline.process_metrics(request);
    let points = gauge_points(&metrics_of(&result.batch)[0]);

    assert_eq!(points.len(), 1);
    assert_eq!(get_str(&points[0].attributes, "seen"), Some("yes"));
    assert_eq!(result.errors.len(), 1);
    assert!(matches!(result.errors[0], PipelineError::RulesSkipped(_)));
    assert_eq!(*reporter.failures.lock(), vec!["dropper"]);
    assert_eq!(reporter.batches.lock().len(), 1);
}

#[test]
fn test_resolver_error_does_not_remove_record() {
    let pipeline = Pipeline::for_metrics(
        stages(r#"[{"kind": "endpoint"}]"#, "[]", &[]),
        None,
        MetricNameCase::Preserve,
    );
    let request = metrics_request(
        &[],
        vec![metric(
            "g",
            Data::Gauge(Gauge {
                data_points: vec![NumberDataPoint {
                    attributes: vec![kvlist_attr("ip")],
                    ..Default::default()
                }],
            }),
        )],
    );
    let result = pipeline.process_metrics(request);
    assert_eq!(result.stats.retained(), 1);
    assert!(matches!(
        result.errors[0],
        PipelineError::NonStringValue { .. }
    ));
}

// ============================================================================
// LIMITER
// ============================================================================

fn gauge_with_series(name: &str, n: usize) -> Metric {
    let points = (0..n)
        .map(|i| NumberDataPoint {
            attributes: vec![make_str_attr("operation", format!("op-{i}"))],
            ..Default::default()
        })
        .collect();
    metric(name, Data::Gauge(Gauge { data_points: points }))
}

#[test]
fn test_observe_policy_keeps_rejected_records() {
    let reporter = Arc::new(RecordingReporter::default());
    let pipeline = Pipeline::for_metrics(
        stages("[]", "[]", &[]),
        Some(limiter(2, LimitPolicy::Observe)),
        MetricNameCase::Preserve,
    )
    .with_reporter(reporter.clone());

    let result = pipeline.process_metrics(metrics_request(&[], vec![gauge_with_series("requests", 3)]));

    assert_eq!(gauge_points(&metrics_of(&result.batch)[0]).len(), 3);
    assert_eq!(result.stats.rejected, 1);
    assert_eq!(result.stats.dropped_by_limiter, 0);
    assert_eq!(*reporter.rejections.lock(), vec!["requests".to_string()]);
}

#[test]
fn test_drop_policy_removes_rejected_records() {
    let reporter = Arc::new(RecordingReporter::default());
    let pipeline = Pipeline::for_metrics(
        stages("[]", "[]", &[]),
        Some(limiter(2, LimitPolicy::Drop)),
        MetricNameCase::Preserve,
    )
    .with_reporter(reporter.clone());

    let result = pipeline.process_metrics(metrics_request(&[], vec![gauge_with_series("requests", 3)]));
    let points = gauge_points(&metrics_of(&result.batch)[0]);

    assert_eq!(points.len(), 2);
    assert_eq!(get_str(&points[1].attributes, "operation"), Some("op-1"));
    assert_eq!(result.stats.dropped_by_limiter, 1);
    assert_eq!(
        *reporter.drops.lock(),
        vec![("limiter", "requests".to_string())]
    );
}

#[test]
fn test_dropped_records_never_reach_limiter() {
    let l = limiter(10, LimitPolicy::Observe);
    let pipeline = Pipeline::for_metrics(
        stages(
            "[]",
            r#"[{"selectors": [{"dimension": "operation", "match": "*"}], "action": "drop"}]"#,
            &[],
        ),
        Some(l.clone()),
        MetricNameCase::Preserve,
    );

    let result = pipeline.process_metrics(metrics_request(&[], vec![gauge_with_series("requests", 3)]));
    assert_eq!(result.stats.dropped_by_rules, 3);
    assert_eq!(l.series_count("requests"), 0);
}

#[test]
fn test_reserved_records_bypass_budget() {
    let l = limiter(1, LimitPolicy::Drop);
    let pipeline = Pipeline::for_metrics(
        stages("[]", KEEP_CHECKOUT, &[]),
        Some(l.clone()),
        MetricNameCase::Preserve,
    );
    let request = metrics_request(
        &[],
        vec![gauge(
            "requests",
            &[
                &[("service", "checkout"), ("op", "a")],
                &[("service", "checkout"), ("op", "b")],
                &[("service", "checkout"), ("op", "c")],
            ],
        )],
    );

    let result = pipeline.process_metrics(request);
    assert_eq!(gauge_points(&metrics_of(&result.batch)[0]).len(), 3);
    assert_eq!(result.stats.reserved, 3);
    assert_eq!(l.series_count("requests"), 0);
}

#[test]
fn test_replace_matched_records_bypass_budget() {
    let rules = r#"[{"selectors": [{"dimension": "service", "match": "checkout"}],
        "action": "replace", "replacements": [{"target_dimension": "op", "value": "masked"}]}]"#;
    let l = limiter(1, LimitPolicy::Drop);
    let pipeline = Pipeline::for_metrics(
        stages("[]", rules, &[]),
        Some(l.clone()),
        MetricNameCase::Preserve,
    );
    let request = metrics_request(
        &[],
        vec![gauge(
            "requests",
            &[
                &[("service", "checkout"), ("op", "a")],
                &[("service", "checkout"), ("op", "b")],
                &[("service", "cart"), ("op", "c")],
                &[("service", "cart"), ("op", "d")],
            ],
        )],
    );

    let result = pipeline.process_metrics(request);
    assert_eq!(result.stats.reserved, 2);
    assert_eq!(result.stats.dropped_by_limiter, 1);
    assert_eq!(result.stats.retained(), 3);
    assert_eq!(l.series_count("requests"), 1);

    let points = gauge_points(&metrics_of(&result.batch)[0]);
    assert_eq!(get_str(&points[0].attributes, "op"), Some("masked"));
    assert_eq!(get_str(&points[2].attributes, "op"), Some("c"));
}

#[test]
fn test_limiter_fails_open_on_empty_metric_name() {
    let pipeline = Pipeline::for_metrics(
        stages("[]", "[]", &[]),
        Some(limiter(0, LimitPolicy::Drop)),
        MetricNameCase::Preserve,
    );
    let result = pipeline.process_metrics(metrics_request(&[], vec![gauge_with_series("", 2)]));

    assert_eq!(gauge_points(&metrics_of(&result.batch)[0]).len(), 2);
    assert_eq!(result.stats.failed_open, 2);
    assert!(matches!(result.errors[0], PipelineError::Limiter(_)));
}

#[test]
fn test_budget_spans_batches() {
    let pipeline = Pipeline::for_metrics(
        stages("[]", "[]", &[]),
        Some(limiter(2, LimitPolicy::Drop)),
        MetricNameCase::Preserve,
    );
    let first = pipeline.process_metrics(metrics_request(&[], vec![gauge_with_series("requests", 2)]));
    assert_eq!(first.stats.retained(), 2);

    let second = pipeline.process_metrics(metrics_request(&[], vec![gauge_with_series("requests", 3)]));
    assert_eq!(second.stats.retained(), 2);
    assert_eq!(second.stats.rejected, 1);
}

// ============================================================================
// TRACES
// ============================================================================

fn span(pairs: &[(&str, &str)]) -> Span {
    Span {
        name: "GET /cart".to_string(),
        attributes: attrs(pairs),
        ..Default::default()
    }
}

#[test]
fn test_traces_are_mutated_but_never_dropped() {
    let rules = r#"[
        {"selectors": [{"dimension": "service", "match": "checkout"}], "action": "keep"},
        {"selectors": [{"dimension": "service", "match": "*"}], "action": "drop"},
        {"selectors": [{"dimension": "service", "match": "checkout"}], "action": "replace",
         "replacements": [{"target_dimension": "tier", "value": "gold"}]}
    ]"#;
    let pipeline = Pipeline::for_traces(stages(CHECKOUT_RESOLVER, rules, &["service"]));

    let result = pipeline.process_traces(traces_request(vec![
        span(&[("ip", "10.0.0.5"), ("tier", "bronze")]),
        span(&[("service", "unknown"), ("tier", "bronze")]),
    ]));
    let spans = &result.batch.resource_spans[0].scope_spans[0].spans;

    assert_eq!(spans.len(), 2);
    assert_eq!(get_str(&spans[0].attributes, "service"), Some("checkout"));
    assert_eq!(get_str(&spans[0].attributes, "tier"), Some("gold"));
    assert_eq!(get_str(&spans[1].attributes, "tier"), Some("bronze"));
    assert_eq!(result.stats.seen, 2);
    assert_eq!(result.stats.retained(), 2);
}

#[test]
fn test_pipeline_is_shareable_across_threads() {
    let pipeline = Arc::new(Pipeline::for_metrics(
        stages("[]", "[]", &[]),
        Some(limiter(5, LimitPolicy::Drop)),
        MetricNameCase::Preserve,
    ));

    let retained: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                scope.spawn(move || {
                    pipeline
                        .process_metrics(metrics_request(&[], vec![gauge_with_series("shared", 5)]))
                        .stats
                        .retained()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    // Every batch carries the same five series
    assert_eq!(retained, 20);
}
