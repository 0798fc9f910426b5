//! Keeper, dropper and replacer roles over a shared [`RuleSet`]

use std::sync::Arc;

use opentelemetry_proto::tonic::common::v1::KeyValue;

use super::RuleSet;
use crate::domain::error::{PipelineError, RuleError};
use crate::domain::record::RecordKind;
use crate::domain::traits::{AllowListMutator, AttributesMutator, Verdict};
use crate::utils::otlp::{has_attr, set_str};

/// Allow-list: drops records matching no keep rule, when keep rules exist
pub struct Keeper {
    rules: Arc<RuleSet>,
    mark_reserved: bool,
}

impl Keeper {
    /// `mark_reserved` exempts kept records from the cardinality budget
    pub fn new(rules: Arc<RuleSet>, mark_reserved: bool) -> Self {
        Self {
            rules,
            mark_reserved,
        }
    }
}

impl AllowListMutator for Keeper {
    fn name(&self) -> &'static str {
        "keeper"
    }

    fn should_be_dropped(&self, attrs: &[KeyValue]) -> Verdict {
        let mut verdict = Verdict::keep();
        let mut has_keep_rules = false;

        for rule in self.rules.keep_rules() {
            has_keep_rules = true;
            match rule.matches(attrs) {
                Ok(true) => return verdict,
                Ok(false) => {}
                Err(e) => verdict.skipped.push(e),
            }
        }

        verdict.drop = has_keep_rules;
        verdict
    }

    fn reserves(&self, attrs: &[KeyValue]) -> bool {
        self.mark_reserved
            && self
                .rules
                .keep_rules()
                .any(|rule| rule.matches(attrs).unwrap_or(false))
    }
}

/// Deny-list: drops records matching any drop rule
pub struct Dropper {
    rules: Arc<RuleSet>,
}

impl Dropper {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }
}

impl AllowListMutator for Dropper {
    fn name(&self) -> &'static str {
        "dropper"
    }

    fn should_be_dropped(&self, attrs: &[KeyValue]) -> Verdict {
        let mut verdict = Verdict::keep();

        for rule in self.rules.drop_rules() {
            match rule.matches(attrs) {
                Ok(true) => {
                    verdict.drop = true;
                    return verdict;
                }
                Ok(false) => {}
                Err(e) => verdict.skipped.push(e),
            }
        }

        verdict
    }
}

/// Rewrites attribute values for every matching replace rule, in order.
/// A later rule overwrites an earlier rule's value on the same key.
/// Only keys already on the record are rewritten; no dimension is added.
pub struct Replacer {
    rules: Arc<RuleSet>,
    mark_reserved: bool,
}

/// Result of one replacer pass over a record
#[derive(Debug, Default)]
pub struct Replaced {
    /// A replace rule matched and the replacer marks matches as reserved
    pub reserved: bool,
    pub skipped: Vec<RuleError>,
}

impl Replacer {
    /// `mark_reserved` exempts records matched by a replace rule from the cardinality budget
    pub fn new(rules: Arc<RuleSet>, mark_reserved: bool) -> Self {
        Self {
            rules,
            mark_reserved,
        }
    }

    pub fn apply(&self, attrs: &mut Vec<KeyValue>) -> Replaced {
        let mut outcome = Replaced::default();

        for (rule, replacements) in self.rules.replace_rules() {
            match rule.matches(attrs) {
                Ok(true) => {
                    outcome.reserved |= self.mark_reserved;
                    for (key, value) in replacements {
                        if has_attr(attrs, key) {
                            set_str(attrs, key, value.as_str());
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::trace!(rule = ?rule.name(), error = %e, "Skipping replace rule");
                    outcome.skipped.push(e);
                }
            }
        }

        outcome
    }
}

impl AttributesMutator for Replacer {
    fn name(&self) -> &'static str {
        "replacer"
    }

    fn process(
        &self,
        attrs: &mut Vec<KeyValue>,
        _resource_attrs: &[KeyValue],
        _kind: RecordKind,
    ) -> Result<(), PipelineError> {
        let replaced = self.apply(attrs);
        if replaced.skipped.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::RulesSkipped(replaced.skipped))
        }
    }
}
