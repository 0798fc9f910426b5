//! Environment resolver: fills the deployment environment from the resource

use opentelemetry_proto::tonic::common::v1::KeyValue;
use serde::Deserialize;

use crate::core::constants::DEFAULT_ENVIRONMENT;
use crate::domain::error::PipelineError;
use crate::domain::record::RecordKind;
use crate::domain::traits::AttributesMutator;
use crate::utils::otlp::{get_environment, has_attr, keys, set_str};

fn default_target_key() -> String {
    keys::DEPLOYMENT_ENV.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_target_key")]
    pub target_key: String,
    /// Used when the resource names no environment
    #[serde(default = "default_environment")]
    pub default: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            target_key: default_target_key(),
            default: default_environment(),
        }
    }
}

pub struct EnvironmentResolver {
    target_key: String,
    default: String,
}

impl EnvironmentResolver {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            target_key: config.target_key.clone(),
            default: config.default.clone(),
        }
    }
}

impl AttributesMutator for EnvironmentResolver {
    fn name(&self) -> &'static str {
        "environment_resolver"
    }

    fn process(
        &self,
        attrs: &mut Vec<KeyValue>,
        resource_attrs: &[KeyValue],
        _kind: RecordKind,
    ) -> Result<(), PipelineError> {
        if has_attr(attrs, &self.target_key) {
            return Ok(());
        }
        let environment = get_environment(resource_attrs).unwrap_or(&self.default);
        set_str(attrs, &self.target_key, environment);
        Ok(())
    }
}
