//! Stage traits shared by the pipeline components

use opentelemetry_proto::tonic::common::v1::KeyValue;

use super::error::{PipelineError, RuleError};
use super::record::RecordKind;

/// Mutates a record's attributes in place (resolver, normalizer, replacer)
pub trait AttributesMutator: Send + Sync {
    /// Stage name used when reporting failures
    fn name(&self) -> &'static str;

    fn process(
        &self,
        attrs: &mut Vec<KeyValue>,
        resource_attrs: &[KeyValue],
        kind: RecordKind,
    ) -> Result<(), PipelineError>;
}

/// Outcome of an allow/deny check.
///
/// Rules that failed to evaluate are skipped and listed in `skipped`;
/// `drop` reflects the rules that did evaluate.
#[derive(Debug, Default)]
pub struct Verdict {
    pub drop: bool,
    pub skipped: Vec<RuleError>,
}

impl Verdict {
    pub fn keep() -> Self {
        Self::default()
    }

    /// Skipped rules as a reportable error, if any
    pub fn take_error(&mut self) -> Option<PipelineError> {
        if self.skipped.is_empty() {
            None
        } else {
            Some(PipelineError::RulesSkipped(std::mem::take(&mut self.skipped)))
        }
    }
}

/// Decides whether a metric record leaves the batch (keeper, dropper)
pub trait AllowListMutator: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_be_dropped(&self, attrs: &[KeyValue]) -> Verdict;

    /// Whether the record is exempt from the cardinality budget
    fn reserves(&self, _attrs: &[KeyValue]) -> bool {
        false
    }
}
