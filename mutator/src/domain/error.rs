//! Pipeline error types

use thiserror::Error;

/// Errors raised while evaluating or compiling a rule
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Rule {index} has no selectors")]
    NoSelectors { index: usize },

    #[error("Rule {index} replaces nothing (empty replacements)")]
    NoReplacements { index: usize },

    #[error("Invalid match pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Attribute '{key}' holds a non-scalar value")]
    NonScalarValue { key: String },

    #[error("Rename '{from}' -> '{to}' chains into another rename of '{to}'")]
    RenameChain { from: String, to: String },
}

/// Errors raised by the cardinality limiter. Always fail-open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("Metric name is empty")]
    EmptyMetricName,
}

/// Per-record stage errors. None of these abort a batch.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Attribute '{key}' is not a string value")]
    NonStringValue { key: String },

    #[error("{} rule(s) skipped: {}", .0.len(), first_rule_error(.0))]
    RulesSkipped(Vec<RuleError>),

    #[error("Cardinality limiter failed open: {0}")]
    Limiter(#[from] LimiterError),

    #[error("{0} pipeline has not been started")]
    NotStarted(&'static str),
}

fn first_rule_error(errors: &[RuleError]) -> String {
    errors.first().map(|e| e.to_string()).unwrap_or_default()
}

/// Errors raised while stopping a background component
#[derive(Error, Debug)]
pub enum StopError {
    #[error("Stop of {component} cancelled before the background task finished")]
    Cancelled { component: &'static str },

    #[error("Timed out after {secs}s waiting for {component} to stop")]
    Timeout { component: &'static str, secs: u64 },

    #[error("Background task of {component} failed: {message}")]
    Join {
        component: &'static str,
        message: String,
    },
}
