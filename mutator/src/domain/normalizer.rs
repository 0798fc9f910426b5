//! Attribute normalization
//!
//! Canonicalizes representation so semantically identical attributes compare
//! equal downstream (rules, limiter fingerprints):
//! 1. Structural cleanup: empty entries removed, duplicate keys collapsed
//! 2. Key renames (never overwriting an existing key)
//! 3. String values trimmed, lowercased for configured keys
//! 4. Overlong string values truncated on a char boundary
//!
//! Every step is idempotent, so normalizing twice equals normalizing once.

use std::collections::HashMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use opentelemetry_proto::tonic::common::v1::{KeyValue, any_value};
use serde::Deserialize;

use super::error::{PipelineError, RuleError};
use super::record::RecordKind;
use super::traits::AttributesMutator;
use crate::core::constants::DEFAULT_MAX_VALUE_LENGTH;

/// Metric name casing applied by the metrics pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricNameCase {
    #[default]
    Preserve,
    Title,
}

impl MetricNameCase {
    pub fn apply(self, name: &str) -> Option<String> {
        match self {
            MetricNameCase::Preserve => None,
            MetricNameCase::Title => Some(title_case(name)),
        }
    }
}

/// Uppercase the first letter of each whitespace-separated word, lowercase the rest
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut word_start = true;
    for c in name.chars() {
        if c.is_whitespace() {
            word_start = true;
            out.push(c);
        } else if word_start {
            word_start = false;
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Source key -> canonical key
    pub rename: HashMap<String, String>,
    /// Globs over keys whose string values are lowercased
    pub lowercase_keys: Vec<String>,
    /// Max characters kept in a string value
    pub max_value_length: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            rename: HashMap::new(),
            lowercase_keys: Vec::new(),
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
        }
    }
}

pub struct AttributesNormalizer {
    rename: HashMap<String, String>,
    lowercase: GlobSet,
    max_value_length: usize,
}

impl AttributesNormalizer {
    /// Rejects rename chains: a chain would move one step per pass and break idempotency
    pub fn new(config: &NormalizerConfig) -> Result<Self, RuleError> {
        let mut chained: Vec<_> = config
            .rename
            .iter()
            .filter(|(_, target)| config.rename.contains_key(*target))
            .collect();
        // HashMap order is random; report the same pair every time
        chained.sort();
        if let Some((from, to)) = chained.first() {
            return Err(RuleError::RenameChain {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.lowercase_keys {
            let glob = Glob::new(pattern).map_err(|source| RuleError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let lowercase = builder.build().map_err(|source| RuleError::InvalidPattern {
            pattern: config.lowercase_keys.join(","),
            source,
        })?;

        Ok(Self {
            rename: config.rename.clone(),
            lowercase,
            max_value_length: config.max_value_length,
        })
    }

    fn dedupe(attrs: &mut Vec<KeyValue>) {
        attrs.retain(|kv| kv.value.as_ref().is_some_and(|v| v.value.is_some()));

        let mut index: HashMap<String, usize> = HashMap::with_capacity(attrs.len());
        let mut out: Vec<KeyValue> = Vec::with_capacity(attrs.len());
        for kv in attrs.drain(..) {
            match index.get(&kv.key) {
                Some(&i) => out[i].value = kv.value,
                None => {
                    index.insert(kv.key.clone(), out.len());
                    out.push(kv);
                }
            }
        }
        *attrs = out;
    }

    fn apply_renames(&self, attrs: &mut [KeyValue]) {
        if self.rename.is_empty() {
            return;
        }
        for i in 0..attrs.len() {
            let Some(target) = self.rename.get(&attrs[i].key) else {
                continue;
            };
            if attrs.iter().any(|kv| &kv.key == target) {
                continue;
            }
            attrs[i].key = target.clone();
        }
    }

    fn canonicalize_value(&self, kv: &mut KeyValue) {
        let Some(any_value::Value::StringValue(s)) = kv.value.as_mut().and_then(|v| v.value.as_mut())
        else {
            return;
        };

        let trimmed = s.trim();
        if trimmed.len() != s.len() {
            *s = trimmed.to_string();
        }

        if self.lowercase.is_match(&kv.key) && s.chars().any(|c| c.is_uppercase()) {
            *s = s.to_lowercase();
        }

        if let Some((cut, _)) = s.char_indices().nth(self.max_value_length) {
            s.truncate(cut);
            // Truncation can expose trailing whitespace
            let kept = s.trim_end().len();
            s.truncate(kept);
        }
    }
}

impl AttributesMutator for AttributesNormalizer {
    fn name(&self) -> &'static str {
        "normalizer"
    }

    fn process(
        &self,
        attrs: &mut Vec<KeyValue>,
        _resource_attrs: &[KeyValue],
        _kind: RecordKind,
    ) -> Result<(), PipelineError> {
        Self::dedupe(attrs);
        self.apply_renames(attrs);
        for kv in attrs.iter_mut() {
            self.canonicalize_value(kv);
        }
        Ok(())
    }
}
