//! Pipeline side-channel reporting

use super::error::PipelineError;
use super::limiter::LimitPolicy;
use super::pipeline::BatchStats;
use super::record::RecordKind;

/// Receives per-record outcomes that do not change the batch result
pub trait Reporter: Send + Sync {
    /// A stage failed on one record; the record continued through the pipeline
    fn stage_failed(&self, stage: &'static str, kind: RecordKind, error: &PipelineError);

    /// A record was removed by `stage`
    fn record_dropped(&self, stage: &'static str, metric_name: &str);

    /// A new series of `metric_name` exceeded the budget
    fn series_rejected(&self, metric_name: &str, policy: LimitPolicy);

    fn batch_processed(&self, _kind: RecordKind, _stats: &BatchStats) {}
}

/// Default reporter: structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn stage_failed(&self, stage: &'static str, kind: RecordKind, error: &PipelineError) {
        tracing::debug!(stage, kind = kind.as_str(), error = %error, "Failed to process attributes");
    }

    fn record_dropped(&self, stage: &'static str, metric_name: &str) {
        tracing::trace!(stage, metric = metric_name, "Data point dropped");
    }

    fn series_rejected(&self, metric_name: &str, policy: LimitPolicy) {
        tracing::debug!(
            metric = metric_name,
            policy = policy.as_str(),
            "Series over cardinality budget"
        );
    }

    fn batch_processed(&self, kind: RecordKind, stats: &BatchStats) {
        tracing::trace!(
            kind = kind.as_str(),
            seen = stats.seen,
            dropped = stats.dropped_by_rules + stats.dropped_by_limiter,
            rejected = stats.rejected,
            errors = stats.errors,
            "Batch processed"
        );
    }
}
