//! Processor configuration
//!
//! Two layers: [`ProcessorFileConfig`] mirrors the JSON file with every field
//! optional, and [`ProcessorConfig`] is the resolved, validated result with
//! defaults applied. CLI flags (which carry env var fallbacks) win over the file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{CONFIG_FILE_NAME, DEFAULT_MAX_VALUE_LENGTH};
use crate::domain::limiter::{LimitPolicy, LimiterConfig};
use crate::domain::normalizer::{AttributesNormalizer, MetricNameCase, NormalizerConfig};
use crate::domain::resolver::ResolverConfig;
use crate::domain::rules::{RuleConfig, RuleSet};

// ============================================================================
// FILE CONFIG
// ============================================================================

/// Normalizer section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NormalizerFileConfig {
    /// Source key -> canonical key
    pub rename: Option<HashMap<String, String>>,
    /// Key globs whose values are lowercased
    pub lowercase_keys: Option<Vec<String>>,
    pub max_value_length: Option<usize>,
}

/// Limiter section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct LimiterFileConfig {
    pub disabled: Option<bool>,
    pub max_series: Option<usize>,
    /// Humantime string, e.g. "1h" or "15m"
    #[serde(default, with = "humantime_serde")]
    pub rotation_interval: Option<Duration>,
    pub on_limit: Option<LimitPolicy>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct ProcessorFileConfig {
    pub resolvers: Option<Vec<ResolverConfig>>,
    pub rules: Option<Vec<RuleConfig>>,
    pub normalizer: Option<NormalizerFileConfig>,
    pub metric_name_case: Option<MetricNameCase>,
    pub limiter: Option<LimiterFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl ProcessorFileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }
}

// ============================================================================
// RESOLVED CONFIG
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    pub resolvers: Vec<ResolverConfig>,
    pub rules: Vec<RuleConfig>,
    pub normalizer: NormalizerConfig,
    pub metric_name_case: MetricNameCase,
    pub limiter: LimiterConfig,
}

impl ProcessorConfig {
    /// Load configuration. Priority (later overrides earlier):
    /// 1. Defaults
    /// 2. CLI-specified config path, or `otel-mutator.json` in the working directory
    /// 3. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading processor configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let path = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.clone())
            }
            None => {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                local.exists().then_some(local)
            }
        };

        let file_config = match path {
            Some(path) => {
                let file_config = ProcessorFileConfig::load_from_file(&path)?;
                file_config.warn_unknown_fields();
                file_config
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                ProcessorFileConfig::default()
            }
        };

        let config = Self::from_file_config(file_config, cli);
        config.validate()?;

        tracing::debug!(
            resolvers = config.resolvers.len(),
            rules = config.rules.len(),
            limiter_disabled = config.limiter.disabled,
            max_series = config.limiter.max_series,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Apply defaults, then CLI overrides
    fn from_file_config(file: ProcessorFileConfig, cli: &CliConfig) -> Self {
        let normalizer = file.normalizer.unwrap_or_default();
        let limiter = file.limiter.unwrap_or_default();
        let limiter_defaults = LimiterConfig::default();

        Self {
            resolvers: file.resolvers.unwrap_or_default(),
            rules: file.rules.unwrap_or_default(),
            normalizer: NormalizerConfig {
                rename: normalizer.rename.unwrap_or_default(),
                lowercase_keys: normalizer.lowercase_keys.unwrap_or_default(),
                max_value_length: normalizer
                    .max_value_length
                    .unwrap_or(DEFAULT_MAX_VALUE_LENGTH),
            },
            metric_name_case: file.metric_name_case.unwrap_or_default(),
            limiter: LimiterConfig {
                disabled: cli.no_limiter || limiter.disabled.unwrap_or(false),
                max_series: cli
                    .max_series
                    .or(limiter.max_series)
                    .unwrap_or(limiter_defaults.max_series),
                rotation_interval: limiter
                    .rotation_interval
                    .unwrap_or(limiter_defaults.rotation_interval),
                on_limit: limiter.on_limit.unwrap_or_default(),
                parent_token: None,
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.normalizer.max_value_length == 0 {
            anyhow::bail!(
                "Configuration error: normalizer.max_value_length must be greater than 0"
            );
        }

        if !self.limiter.disabled {
            if self.limiter.rotation_interval.is_zero() {
                anyhow::bail!(
                    "Configuration error: limiter.rotation_interval must be greater than 0"
                );
            }
            if self.limiter.max_series == 0 {
                tracing::warn!("limiter.max_series is 0, every new series will be rejected");
            }
        }

        RuleSet::compile(&self.rules).context("Configuration error: invalid rules")?;
        AttributesNormalizer::new(&self.normalizer)
            .context("Configuration error: invalid normalizer")?;

        Ok(())
    }
}
