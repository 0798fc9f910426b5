//! Endpoint resolver
//!
//! Coarsens raw network addresses (peer IPs, socket addresses, host names)
//! into a logical service name, the single biggest source of series
//! cardinality in service-to-service metrics.
//!
//! The lookup table is immutable and swapped whole behind an `RwLock<Arc<..>>`;
//! each table carries its own resolution cache, so a swap never leaves stale
//! memoized entries behind.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use moka::sync::Cache;
use opentelemetry_proto::tonic::common::v1::{KeyValue, any_value};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::constants::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_ENDPOINT_SOURCE_KEYS, DEFAULT_ENDPOINT_TARGET_KEY,
    DEFAULT_REFRESH_INTERVAL_SECS,
};
use crate::core::shutdown::{BackgroundTask, Stopper};
use crate::domain::error::{PipelineError, StopError};
use crate::domain::record::RecordKind;
use crate::domain::traits::AttributesMutator;
use crate::utils::otlp::{get_attr, has_attr, set_str};

const COMPONENT: &str = "endpoint resolver";

// ============================================================================
// CONFIGURATION
// ============================================================================

fn default_source_keys() -> Vec<String> {
    DEFAULT_ENDPOINT_SOURCE_KEYS
        .iter()
        .map(|k| k.to_string())
        .collect()
}

fn default_target_key() -> String {
    DEFAULT_ENDPOINT_TARGET_KEY.to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)
}

fn default_cache_capacity() -> u64 {
    DEFAULT_CACHE_CAPACITY
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Keys consulted for the raw address; first present wins
    #[serde(default = "default_source_keys")]
    pub source_keys: Vec<String>,
    #[serde(default = "default_target_key")]
    pub target_key: String,
    /// Target used for spans; falls back to `target_key`
    #[serde(default)]
    pub trace_target_key: Option<String>,
    /// Exact IP, CIDR block or host name -> service name
    #[serde(default)]
    pub entries: HashMap<String, String>,
    /// JSON file with the same shape as `entries`, reloaded periodically
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Written to the target key when an address resolves to nothing
    #[serde(default)]
    pub unresolved_value: Option<String>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            source_keys: default_source_keys(),
            target_key: default_target_key(),
            trace_target_key: None,
            entries: HashMap::new(),
            path: None,
            refresh_interval: default_refresh_interval(),
            unresolved_value: None,
            cache_capacity: default_cache_capacity(),
        }
    }
}

// ============================================================================
// LOOKUP TABLE
// ============================================================================

struct EndpointTable {
    exact: HashMap<IpAddr, String>,
    /// Longest prefix first
    networks: Vec<(IpNet, String)>,
    hosts: HashMap<String, String>,
    cache: Cache<String, Option<String>>,
}

impl EndpointTable {
    fn build<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a String)>,
        cache_capacity: u64,
    ) -> Self {
        let mut exact = HashMap::new();
        let mut networks = Vec::new();
        let mut hosts = HashMap::new();

        for (key, service) in entries {
            let key = key.trim();
            if let Ok(ip) = key.parse::<IpAddr>() {
                exact.insert(ip, service.clone());
            } else if let Ok(net) = key.parse::<IpNet>() {
                networks.push((net.trunc(), service.clone()));
            } else {
                hosts.insert(key.to_lowercase(), service.clone());
            }
        }
        networks.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));

        Self {
            exact,
            networks,
            hosts,
            cache: Cache::new(cache_capacity),
        }
    }

    fn len(&self) -> usize {
        self.exact.len() + self.networks.len() + self.hosts.len()
    }

    fn lookup(&self, address: &str) -> Option<&str> {
        let address = address.trim();
        let ip = address
            .parse::<IpAddr>()
            .ok()
            .or_else(|| address.parse::<SocketAddr>().ok().map(|s| s.ip()));

        if let Some(ip) = ip {
            if let Some(service) = self.exact.get(&ip) {
                return Some(service);
            }
            return self
                .networks
                .iter()
                .find(|(net, _)| net.contains(&ip))
                .map(|(_, service)| service.as_str());
        }

        self.hosts
            .get(&strip_port(address).to_lowercase())
            .map(String::as_str)
    }

    fn resolve(&self, address: &str) -> Option<String> {
        if let Some(hit) = self.cache.get(address) {
            return hit;
        }
        let resolved = self.lookup(address).map(str::to_string);
        self.cache.insert(address.to_string(), resolved.clone());
        resolved
    }
}

/// `host:port` -> `host`, leaving anything else untouched
fn strip_port(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => address,
    }
}

fn read_entries(path: &Path, raw: &str) -> Result<HashMap<String, String>> {
    serde_json::from_str(raw)
        .with_context(|| format!("Failed to parse endpoint table {}", path.display()))
}

// ============================================================================
// RESOLVER
// ============================================================================

struct TableSource {
    inline: HashMap<String, String>,
    path: Option<PathBuf>,
    cache_capacity: u64,
}

impl TableSource {
    /// File entries override inline ones
    fn build(&self, file: &HashMap<String, String>) -> EndpointTable {
        EndpointTable::build(
            self.inline
                .iter()
                .filter(|(key, _)| !file.contains_key(*key))
                .chain(file.iter()),
            self.cache_capacity,
        )
    }

    fn load_initial(&self) -> EndpointTable {
        let Some(path) = &self.path else {
            return self.build(&HashMap::new());
        };
        let loaded = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read endpoint table {}", path.display()))
            .and_then(|raw| read_entries(path, &raw));
        match loaded {
            Ok(file) => self.build(&file),
            Err(e) => {
                tracing::warn!(error = %e, "Using inline endpoint entries only");
                self.build(&HashMap::new())
            }
        }
    }

    async fn reload(&self, path: &Path) -> Result<EndpointTable> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read endpoint table {}", path.display()))?;
        let file = read_entries(path, &raw)?;
        Ok(self.build(&file))
    }
}

pub struct EndpointResolver {
    source_keys: Vec<String>,
    target_key: String,
    trace_target_key: String,
    unresolved_value: Option<String>,
    refresh_interval: Duration,
    source: Arc<TableSource>,
    table: Arc<RwLock<Arc<EndpointTable>>>,
    refresh: OnceLock<BackgroundTask>,
}

impl EndpointResolver {
    pub fn new(config: &EndpointConfig) -> Self {
        let source = TableSource {
            inline: config.entries.clone(),
            path: config.path.clone(),
            cache_capacity: config.cache_capacity,
        };
        let table = source.load_initial();
        tracing::debug!(entries = table.len(), "Endpoint table loaded");

        Self {
            source_keys: config.source_keys.clone(),
            target_key: config.target_key.clone(),
            trace_target_key: config
                .trace_target_key
                .clone()
                .unwrap_or_else(|| config.target_key.clone()),
            unresolved_value: config.unresolved_value.clone(),
            refresh_interval: config.refresh_interval,
            source: Arc::new(source),
            table: Arc::new(RwLock::new(Arc::new(table))),
            refresh: OnceLock::new(),
        }
    }

    /// Spawn the file reload task, if a table file is configured.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, parent: &CancellationToken) {
        let Some(path) = self.source.path.clone() else {
            return;
        };
        if self.refresh_interval.is_zero() {
            return;
        }

        self.refresh.get_or_init(|| {
            let token = parent.child_token();
            let observed = token.clone();
            let source = Arc::clone(&self.source);
            let table = Arc::clone(&self.table);
            let interval = self.refresh_interval;

            BackgroundTask::spawn(COMPONENT, token, async move {
                let mut timer = tokio::time::interval(interval);
                timer.tick().await; // Skip immediate first tick

                loop {
                    tokio::select! {
                        biased;
                        _ = observed.cancelled() => break,
                        _ = timer.tick() => match source.reload(&path).await {
                            Ok(next) => {
                                tracing::debug!(entries = next.len(), "Endpoint table reloaded");
                                *table.write() = Arc::new(next);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Endpoint table reload failed, keeping previous table");
                            }
                        },
                    }
                }
            })
        });
    }

    fn target_key(&self, kind: RecordKind) -> &str {
        if kind.is_trace() {
            &self.trace_target_key
        } else {
            &self.target_key
        }
    }
}

impl AttributesMutator for EndpointResolver {
    fn name(&self) -> &'static str {
        "endpoint_resolver"
    }

    fn process(
        &self,
        attrs: &mut Vec<KeyValue>,
        _resource_attrs: &[KeyValue],
        kind: RecordKind,
    ) -> Result<(), PipelineError> {
        let target = self.target_key(kind);
        if has_attr(attrs, target) {
            return Ok(());
        }

        let Some((key, value)) = self
            .source_keys
            .iter()
            .find_map(|key| get_attr(attrs, key).map(|value| (key, value)))
        else {
            return Ok(());
        };
        let Some(any_value::Value::StringValue(address)) = &value.value else {
            return Err(PipelineError::NonStringValue { key: key.clone() });
        };

        let table = self.table.read().clone();
        let resolved = table
            .resolve(address)
            .or_else(|| self.unresolved_value.clone());
        if let Some(service) = resolved {
            set_str(attrs, target, service);
        }
        Ok(())
    }
}

#[async_trait]
impl Stopper for EndpointResolver {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    async fn stop(&self, ctx: &CancellationToken) -> Result<(), StopError> {
        match self.refresh.get() {
            Some(task) => task.stop(ctx).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;
