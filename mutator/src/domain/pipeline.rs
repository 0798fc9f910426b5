//! Mutation pipeline
//!
//! Runs the stages over every record of a batch in a fixed order:
//!
//! ```text
//! resolver -> normalizer -> [keeper, dropper] -> replacer -> [limiter]
//! ```
//!
//! Bracketed stages apply to metric data points only. The five metric point
//! kinds and spans share one traversal through [`Record`]. Stage failures
//! never abort a batch: they are collected, reported, and the record moves on.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::metrics::v1::{Metric, metric::Data};

use super::error::PipelineError;
use super::limiter::{Admission, LimitPolicy, MetricsLimiter};
use super::normalizer::{AttributesNormalizer, MetricNameCase};
use super::record::{Record, RecordKind};
use super::report::{Reporter, TracingReporter};
use super::resolver::AttributesResolver;
use super::rules::{Dropper, Keeper, Replacer, RuleSet};
use super::traits::{AllowListMutator, AttributesMutator};

const LIMITER_STAGE: &str = "limiter";

/// Per-batch counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    /// Records entering the pipeline
    pub seen: usize,
    /// Removed by keeper or dropper
    pub dropped_by_rules: usize,
    /// New series over budget, whatever the policy
    pub rejected: usize,
    /// Rejected and removed under [`LimitPolicy::Drop`]
    pub dropped_by_limiter: usize,
    /// Exempt from the cardinality budget by a keep or replace rule
    pub reserved: usize,
    /// Admitted because the limiter failed open
    pub failed_open: usize,
    /// Stage failures, all stages
    pub errors: usize,
}

impl BatchStats {
    pub fn retained(&self) -> usize {
        self.seen - self.dropped_by_rules - self.dropped_by_limiter
    }
}

/// A processed batch with everything that went wrong along the way
#[derive(Debug)]
pub struct ProcessedBatch<T> {
    pub batch: T,
    pub errors: Vec<PipelineError>,
    pub stats: BatchStats,
}

#[derive(Default)]
struct Outcome {
    errors: Vec<PipelineError>,
    stats: BatchStats,
}

/// Shared stage components
pub struct PipelineStages {
    pub resolver: Arc<AttributesResolver>,
    pub normalizer: Arc<AttributesNormalizer>,
    pub rules: Arc<RuleSet>,
}

pub struct Pipeline {
    mutators: Vec<Arc<dyn AttributesMutator>>,
    allow_list: Vec<Arc<dyn AllowListMutator>>,
    replacer: Replacer,
    limiter: Option<Arc<MetricsLimiter>>,
    metric_name_case: MetricNameCase,
    reporter: Arc<dyn Reporter>,
}

impl Pipeline {
    /// Metrics pipeline. Keep and replace rules reserve budget only while a
    /// limiter is present.
    pub fn for_metrics(
        stages: PipelineStages,
        limiter: Option<Arc<MetricsLimiter>>,
        metric_name_case: MetricNameCase,
    ) -> Self {
        let mark_reserved = limiter.is_some();
        let allow_list: Vec<Arc<dyn AllowListMutator>> = vec![
            Arc::new(Keeper::new(Arc::clone(&stages.rules), mark_reserved)),
            Arc::new(Dropper::new(Arc::clone(&stages.rules))),
        ];
        Self {
            mutators: Self::mutators(&stages),
            allow_list,
            replacer: Replacer::new(stages.rules, mark_reserved),
            limiter,
            metric_name_case,
            reporter: Arc::new(TracingReporter),
        }
    }

    /// Traces pipeline: resolver, normalizer and replacer only
    pub fn for_traces(stages: PipelineStages) -> Self {
        Self {
            mutators: Self::mutators(&stages),
            allow_list: Vec::new(),
            replacer: Replacer::new(stages.rules, false),
            limiter: None,
            metric_name_case: MetricNameCase::Preserve,
            reporter: Arc::new(TracingReporter),
        }
    }

    fn mutators(stages: &PipelineStages) -> Vec<Arc<dyn AttributesMutator>> {
        let mut mutators: Vec<Arc<dyn AttributesMutator>> = Vec::with_capacity(2);
        if !stages.resolver.is_empty() {
            mutators.push(stages.resolver.clone());
        }
        mutators.push(stages.normalizer.clone());
        mutators
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    // ========================================================================
    // BATCHES
    // ========================================================================

    pub fn process_metrics(
        &self,
        mut batch: ExportMetricsServiceRequest,
    ) -> ProcessedBatch<ExportMetricsServiceRequest> {
        let mut outcome = Outcome::default();

        for rm in &mut batch.resource_metrics {
            let resource_attrs = rm
                .resource
                .as_ref()
                .map(|r| r.attributes.as_slice())
                .unwrap_or_default();

            for sm in &mut rm.scope_metrics {
                for metric in &mut sm.metrics {
                    if let Some(name) = self.metric_name_case.apply(&metric.name) {
                        metric.name = name;
                    }
                    self.process_metric(metric, resource_attrs, &mut outcome);
                }
            }
        }

        self.finish(RecordKind::Metric, batch, outcome)
    }

    pub fn process_traces(
        &self,
        mut batch: ExportTraceServiceRequest,
    ) -> ProcessedBatch<ExportTraceServiceRequest> {
        let mut outcome = Outcome::default();

        for rs in &mut batch.resource_spans {
            let resource_attrs = rs
                .resource
                .as_ref()
                .map(|r| r.attributes.as_slice())
                .unwrap_or_default();

            for ss in &mut rs.scope_spans {
                // Spans carry no metric name
                self.process_records("", &mut ss.spans, resource_attrs, &mut outcome);
            }
        }

        self.finish(RecordKind::Trace, batch, outcome)
    }

    fn finish<T>(&self, kind: RecordKind, batch: T, outcome: Outcome) -> ProcessedBatch<T> {
        self.reporter.batch_processed(kind, &outcome.stats);
        ProcessedBatch {
            batch,
            errors: outcome.errors,
            stats: outcome.stats,
        }
    }

    fn process_metric(
        &self,
        metric: &mut Metric,
        resource_attrs: &[KeyValue],
        outcome: &mut Outcome,
    ) {
        let name = metric.name.as_str();
        let Some(data) = metric.data.as_mut() else {
            return;
        };

        match data {
            Data::Gauge(g) => {
                self.process_records(name, &mut g.data_points, resource_attrs, outcome)
            }
            Data::Sum(s) => {
                self.process_records(name, &mut s.data_points, resource_attrs, outcome)
            }
            Data::Histogram(h) => {
                self.process_records(name, &mut h.data_points, resource_attrs, outcome)
            }
            Data::ExponentialHistogram(eh) => {
                self.process_records(name, &mut eh.data_points, resource_attrs, outcome)
            }
            Data::Summary(s) => {
                self.process_records(name, &mut s.data_points, resource_attrs, outcome)
            }
        }
    }

    // ========================================================================
    // RECORDS
    // ========================================================================

    fn process_records<R: Record>(
        &self,
        metric_name: &str,
        records: &mut Vec<R>,
        resource_attrs: &[KeyValue],
        outcome: &mut Outcome,
    ) {
        records.retain_mut(|record| {
            self.process_record(
                metric_name,
                record.attributes_mut(),
                R::KIND,
                resource_attrs,
                outcome,
            )
        });
    }

    /// Returns whether the record stays in the batch
    fn process_record(
        &self,
        metric_name: &str,
        attrs: &mut Vec<KeyValue>,
        kind: RecordKind,
        resource_attrs: &[KeyValue],
        outcome: &mut Outcome,
    ) -> bool {
        outcome.stats.seen += 1;

        for mutator in &self.mutators {
            if let Err(e) = mutator.process(attrs, resource_attrs, kind) {
                self.fail(mutator.name(), kind, e, outcome);
            }
        }

        let mut reserved = false;
        if !kind.is_trace() {
            for check in &self.allow_list {
                let mut verdict = check.should_be_dropped(attrs);
                if let Some(e) = verdict.take_error() {
                    self.fail(check.name(), kind, e, outcome);
                }
                if verdict.drop {
                    self.reporter.record_dropped(check.name(), metric_name);
                    outcome.stats.dropped_by_rules += 1;
                    return false;
                }
                reserved |= check.reserves(attrs);
            }
        }

        let replaced = self.replacer.apply(attrs);
        reserved |= replaced.reserved;
        if !replaced.skipped.is_empty() {
            let error = PipelineError::RulesSkipped(replaced.skipped);
            self.fail(self.replacer.name(), kind, error, outcome);
        }

        match &self.limiter {
            Some(limiter) if !kind.is_trace() => {
                if reserved {
                    outcome.stats.reserved += 1;
                    return true;
                }
                self.admit(limiter, metric_name, attrs, resource_attrs, outcome)
            }
            _ => true,
        }
    }

    fn admit(
        &self,
        limiter: &MetricsLimiter,
        metric_name: &str,
        attrs: &[KeyValue],
        resource_attrs: &[KeyValue],
        outcome: &mut Outcome,
    ) -> bool {
        match limiter.admit(metric_name, attrs, resource_attrs) {
            Admission::Tracked | Admission::Admitted => true,
            Admission::Rejected => {
                let policy = limiter.policy();
                outcome.stats.rejected += 1;
                self.reporter.series_rejected(metric_name, policy);
                if policy == LimitPolicy::Drop {
                    outcome.stats.dropped_by_limiter += 1;
                    self.reporter.record_dropped(LIMITER_STAGE, metric_name);
                    return false;
                }
                true
            }
            Admission::FailedOpen(e) => {
                outcome.stats.failed_open += 1;
                self.fail(LIMITER_STAGE, RecordKind::Metric, e.into(), outcome);
                true
            }
        }
    }

    fn fail(
        &self,
        stage: &'static str,
        kind: RecordKind,
        error: PipelineError,
        outcome: &mut Outcome,
    ) {
        self.reporter.stage_failed(stage, kind, &error);
        outcome.stats.errors += 1;
        outcome.errors.push(error);
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
