//! Processor lifecycle
//!
//! Owns the compiled configuration, builds the metrics and traces pipelines
//! on start, and stops every background component on shutdown.

use std::sync::{Arc, OnceLock};

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::error::{PipelineError, RuleError, StopError};
use super::limiter::MetricsLimiter;
use super::normalizer::AttributesNormalizer;
use super::pipeline::{Pipeline, PipelineStages, ProcessedBatch};
use super::report::{Reporter, TracingReporter};
use super::resolver::AttributesResolver;
use super::rules::RuleSet;
use crate::core::config::ProcessorConfig;
use crate::core::shutdown::{Stopper, stop_all};

pub struct Processor {
    config: ProcessorConfig,
    rules: Arc<RuleSet>,
    normalizer: Arc<AttributesNormalizer>,
    reporter: Arc<dyn Reporter>,
    metrics: OnceLock<Pipeline>,
    traces: OnceLock<Pipeline>,
    stoppers: Mutex<Vec<Arc<dyn Stopper>>>,
}

impl Processor {
    /// Compile rules and normalizer patterns. Nothing is spawned until a start call.
    pub fn new(config: ProcessorConfig) -> Result<Self, RuleError> {
        let rules = Arc::new(RuleSet::compile(&config.rules)?);
        let normalizer = Arc::new(AttributesNormalizer::new(&config.normalizer)?);

        tracing::debug!(
            rules = rules.len(),
            resolvers = config.resolvers.len(),
            "Processor created"
        );

        Ok(Self {
            config,
            rules,
            normalizer,
            reporter: Arc::new(TracingReporter),
            metrics: OnceLock::new(),
            traces: OnceLock::new(),
            stoppers: Mutex::new(Vec::new()),
        })
    }

    /// Replace the default reporter. Takes effect for pipelines started afterwards.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Resolvers are built per pipeline so each owns its refresh task
    fn stages(&self, resolver: Arc<AttributesResolver>) -> PipelineStages {
        PipelineStages {
            resolver,
            normalizer: Arc::clone(&self.normalizer),
            rules: Arc::clone(&self.rules),
        }
    }

    fn start_resolver(&self, ctx: &CancellationToken) -> Arc<AttributesResolver> {
        let resolver = Arc::new(AttributesResolver::new(&self.config.resolvers));
        resolver.start(ctx);
        resolver
    }

    /// Build the metrics pipeline and start its background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start_metrics(&self, ctx: &CancellationToken) {
        let mut stoppers = self.stoppers.lock();
        if self.metrics.get().is_some() {
            tracing::warn!("Metrics pipeline already started");
            return;
        }

        let resolver = self.start_resolver(ctx);
        stoppers.push(resolver.clone());

        let limiter = if self.config.limiter.disabled {
            tracing::debug!("Cardinality limiter disabled");
            None
        } else {
            let limiter = Arc::new(MetricsLimiter::new(&self.config.limiter));
            let parent = self.config.limiter.parent_token.as_ref().unwrap_or(ctx);
            limiter.start(parent);
            stoppers.push(limiter.clone());
            Some(limiter)
        };

        let pipeline = Pipeline::for_metrics(
            self.stages(resolver),
            limiter,
            self.config.metric_name_case,
        )
        .with_reporter(Arc::clone(&self.reporter));

        if self.metrics.set(pipeline).is_ok() {
            tracing::debug!("Metrics pipeline started");
        }
    }

    /// Build the traces pipeline and start its background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start_traces(&self, ctx: &CancellationToken) {
        let mut stoppers = self.stoppers.lock();
        if self.traces.get().is_some() {
            tracing::warn!("Traces pipeline already started");
            return;
        }

        let resolver = self.start_resolver(ctx);
        stoppers.push(resolver.clone());

        let pipeline =
            Pipeline::for_traces(self.stages(resolver)).with_reporter(Arc::clone(&self.reporter));

        if self.traces.set(pipeline).is_ok() {
            tracing::debug!("Traces pipeline started");
        }
    }

    pub fn process_metrics(
        &self,
        batch: ExportMetricsServiceRequest,
    ) -> Result<ProcessedBatch<ExportMetricsServiceRequest>, PipelineError> {
        let pipeline = self
            .metrics
            .get()
            .ok_or(PipelineError::NotStarted("metrics"))?;
        Ok(pipeline.process_metrics(batch))
    }

    pub fn process_traces(
        &self,
        batch: ExportTraceServiceRequest,
    ) -> Result<ProcessedBatch<ExportTraceServiceRequest>, PipelineError> {
        let pipeline = self
            .traces
            .get()
            .ok_or(PipelineError::NotStarted("traces"))?;
        Ok(pipeline.process_traces(batch))
    }

    /// Stop every background component. Failures are logged and returned;
    /// one failing component never prevents the others from stopping.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Vec<StopError> {
        let stoppers = self.stoppers.lock().clone();
        let errors = stop_all(&stoppers, ctx).await;
        if errors.is_empty() {
            tracing::debug!("Processor shut down");
        }
        errors
    }
}
