//! Attribute resolvers
//!
//! Derive attributes the record does not carry from local lookup tables and
//! the enclosing resource. Resolvers never perform network I/O while
//! processing; anything slow happens in background refresh tasks.

mod endpoint;
mod environment;

pub use endpoint::{EndpointConfig, EndpointResolver};
pub use environment::{EnvironmentConfig, EnvironmentResolver};

use async_trait::async_trait;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::error::{PipelineError, StopError};
use super::record::RecordKind;
use super::traits::AttributesMutator;
use crate::core::shutdown::Stopper;

/// One resolver entry, tagged by `kind`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResolverConfig {
    Endpoint(EndpointConfig),
    Environment(EnvironmentConfig),
}

enum Resolver {
    Endpoint(EndpointResolver),
    Environment(EnvironmentResolver),
}

impl Resolver {
    fn as_mutator(&self) -> &dyn AttributesMutator {
        match self {
            Resolver::Endpoint(r) => r,
            Resolver::Environment(r) => r,
        }
    }
}

/// Runs every configured resolver in order
pub struct AttributesResolver {
    resolvers: Vec<Resolver>,
}

impl AttributesResolver {
    pub fn new(configs: &[ResolverConfig]) -> Self {
        let resolvers = configs
            .iter()
            .map(|config| match config {
                ResolverConfig::Endpoint(c) => Resolver::Endpoint(EndpointResolver::new(c)),
                ResolverConfig::Environment(c) => {
                    Resolver::Environment(EnvironmentResolver::new(c))
                }
            })
            .collect();
        Self { resolvers }
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Start background refresh tasks as children of `parent`
    pub fn start(&self, parent: &CancellationToken) {
        for resolver in &self.resolvers {
            if let Resolver::Endpoint(r) = resolver {
                r.start(parent);
            }
        }
    }
}

impl AttributesMutator for AttributesResolver {
    fn name(&self) -> &'static str {
        "resolver"
    }

    /// Every resolver runs; the first failure is returned
    fn process(
        &self,
        attrs: &mut Vec<KeyValue>,
        resource_attrs: &[KeyValue],
        kind: RecordKind,
    ) -> Result<(), PipelineError> {
        let mut first_error = None;
        for resolver in &self.resolvers {
            let mutator = resolver.as_mutator();
            if let Err(e) = mutator.process(attrs, resource_attrs, kind) {
                tracing::trace!(resolver = mutator.name(), error = %e, "Resolver failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Stopper for AttributesResolver {
    fn name(&self) -> &'static str {
        "resolver"
    }

    async fn stop(&self, ctx: &CancellationToken) -> Result<(), StopError> {
        let mut first_error = None;
        for resolver in &self.resolvers {
            if let Resolver::Endpoint(r) = resolver
                && let Err(e) = r.stop(ctx).await
            {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry_proto::tonic::common::v1::{AnyValue, any_value};

    use super::*;
    use crate::utils::otlp::{get_str, keys, make_str_attr};

    fn configs(json: &str) -> Vec<ResolverConfig> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_resolver_config_tagged_by_kind() {
        let parsed = configs(
            r#"[
                {"kind": "endpoint", "entries": {"10.0.0.5": "checkout"}, "refresh_interval": "5m"},
                {"kind": "environment"}
            ]"#,
        );
        assert_eq!(parsed.len(), 2);
        match &parsed[0] {
            ResolverConfig::Endpoint(c) => {
                assert_eq!(c.refresh_interval, std::time::Duration::from_secs(300));
                assert_eq!(c.target_key, "service");
                assert_eq!(c.source_keys.len(), 4);
            }
            other => panic!("unexpected config {:?}", other),
        }
        assert!(matches!(parsed[1], ResolverConfig::Environment(_)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<Vec<ResolverConfig>, _> =
            serde_json::from_str(r#"[{"kind": "dns"}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_runs_all_resolvers_in_order() {
        let resolver = AttributesResolver::new(&configs(
            r#"[
                {"kind": "endpoint", "entries": {"10.0.0.5": "checkout"}},
                {"kind": "environment"}
            ]"#,
        ));
        let resource = vec![make_str_attr(keys::DEPLOYMENT_ENV, "production")];
        let mut attrs = vec![make_str_attr("ip", "10.0.0.5")];
        resolver
            .process(&mut attrs, &resource, RecordKind::Metric)
            .unwrap();

        assert_eq!(get_str(&attrs, "service"), Some("checkout"));
        assert_eq!(get_str(&attrs, keys::DEPLOYMENT_ENV), Some("production"));
    }

    #[test]
    fn test_failure_does_not_stop_later_resolvers() {
        let resolver = AttributesResolver::new(&configs(
            r#"[{"kind": "endpoint"}, {"kind": "environment"}]"#,
        ));
        let mut attrs = vec![KeyValue {
            key: "ip".to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::BoolValue(true)),
            }),
        }];
        let err = resolver
            .process(&mut attrs, &[], RecordKind::Metric)
            .unwrap_err();

        assert!(matches!(err, PipelineError::NonStringValue { .. }));
        assert!(get_str(&attrs, keys::DEPLOYMENT_ENV).is_some());
    }

    #[tokio::test]
    async fn test_stop_without_background_tasks() {
        let resolver = AttributesResolver::new(&configs(r#"[{"kind": "environment"}]"#));
        resolver.start(&CancellationToken::new());
        resolver.stop(&CancellationToken::new()).await.unwrap();
    }
}
