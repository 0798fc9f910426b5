//! Attribute mutation for OTLP metrics and traces
//!
//! - `resolver` - derives attributes from lookup tables and the resource
//! - `normalizer` - canonical keys and values
//! - `rules` - keep, drop and replace rules
//! - `limiter` - per-metric cardinality budget
//! - `pipeline` - runs the stages over a batch
//! - `processor` - pipeline lifecycle and shutdown

pub mod error;
pub mod limiter;
pub mod normalizer;
pub mod pipeline;
pub mod processor;
pub mod record;
pub mod report;
pub mod resolver;
pub mod rules;
pub mod traits;

pub use error::{LimiterError, PipelineError, RuleError, StopError};
pub use pipeline::{BatchStats, Pipeline, ProcessedBatch};
pub use processor::Processor;
pub use report::{Reporter, TracingReporter};
