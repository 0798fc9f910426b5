//! Attribute rules: keep, drop and replace
//!
//! A rule is a list of selectors (attribute key + glob pattern, all of which
//! must match) and an action. Rules are compiled once at start-up and
//! evaluated in configuration order.

mod actions;

pub use actions::{Dropper, Keeper, Replaced, Replacer};

use globset::{Glob, GlobMatcher};
use opentelemetry_proto::tonic::common::v1::KeyValue;
use serde::Deserialize;

use super::error::RuleError;
use crate::utils::otlp::{any_value_to_string, get_attr, is_scalar};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Rule action as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Keep,
    Drop,
    Replace,
}

/// One selector: `dimension` must exist and match the glob in `match`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelectorConfig {
    pub dimension: String,
    #[serde(rename = "match")]
    pub pattern: String,
}

/// One replacement applied by a replace rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplacementConfig {
    pub target_dimension: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub rule_name: Option<String>,
    pub selectors: Vec<SelectorConfig>,
    pub action: RuleAction,
    #[serde(default)]
    pub replacements: Vec<ReplacementConfig>,
}

// ============================================================================
// COMPILED RULES
// ============================================================================

#[derive(Debug)]
struct Selector {
    dimension: String,
    matcher: GlobMatcher,
}

impl Selector {
    fn matches(&self, attrs: &[KeyValue]) -> Result<bool, RuleError> {
        let Some(value) = get_attr(attrs, &self.dimension) else {
            return Ok(false);
        };
        if !is_scalar(value) {
            return Err(RuleError::NonScalarValue {
                key: self.dimension.clone(),
            });
        }
        Ok(self.matcher.is_match(any_value_to_string(value)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Keep,
    Drop,
    Replace(Vec<(String, String)>),
}

#[derive(Debug)]
pub struct Rule {
    name: Option<String>,
    selectors: Vec<Selector>,
    action: Action,
}

impl Rule {
    fn compile(index: usize, config: &RuleConfig) -> Result<Self, RuleError> {
        if config.selectors.is_empty() {
            return Err(RuleError::NoSelectors { index });
        }

        let selectors = config
            .selectors
            .iter()
            .map(|s| {
                let matcher = Glob::new(&s.pattern)
                    .map_err(|source| RuleError::InvalidPattern {
                        pattern: s.pattern.clone(),
                        source,
                    })?
                    .compile_matcher();
                Ok(Selector {
                    dimension: s.dimension.clone(),
                    matcher,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;

        let action = match config.action {
            RuleAction::Keep => Action::Keep,
            RuleAction::Drop => Action::Drop,
            RuleAction::Replace => {
                if config.replacements.is_empty() {
                    return Err(RuleError::NoReplacements { index });
                }
                Action::Replace(
                    config
                        .replacements
                        .iter()
                        .map(|r| (r.target_dimension.clone(), r.value.clone()))
                        .collect(),
                )
            }
        };

        Ok(Self {
            name: config.rule_name.clone(),
            selectors,
            action,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// All selectors must match
    pub fn matches(&self, attrs: &[KeyValue]) -> Result<bool, RuleError> {
        for selector in &self.selectors {
            if !selector.matches(attrs)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn action(&self) -> &Action {
        &self.action
    }
}

/// Ordered, immutable rule set shared by keeper, dropper and replacer
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, RuleError> {
        let rules = configs
            .iter()
            .enumerate()
            .map(|(index, config)| Rule::compile(index, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn keep_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.action == Action::Keep)
    }

    fn drop_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.action == Action::Drop)
    }

    fn replace_rules(&self) -> impl Iterator<Item = (&Rule, &[(String, String)])> {
        self.rules.iter().filter_map(|r| match r.action() {
            Action::Replace(replacements) => Some((r, replacements.as_slice())),
            _ => None,
        })
    }
}
