//! Cardinality limiter
//!
//! Bounds, per metric name, the number of distinct attribute sets (series)
//! admitted within one rotation window.
//!
//! State is a sharded map of per-metric windows, each behind its own mutex,
//! so unrelated metric names never contend. Rotation only bumps a generation
//! counter; a window notices it is stale at its next admission and clears
//! itself under its own lock, so every admission completes against the
//! window state it locked.
//!
//! Internal errors fail open: the record is admitted and the error reported.

mod fingerprint;

pub use fingerprint::{Fingerprint, fingerprint};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::error::{LimiterError, StopError};
use crate::core::constants::{DEFAULT_MAX_SERIES, DEFAULT_ROTATION_INTERVAL_SECS};
use crate::core::shutdown::{BackgroundTask, Stopper};

const COMPONENT: &str = "metrics limiter";

/// What happens to a record whose series exceeds the budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPolicy {
    /// Rejection is reported; the record is kept
    #[default]
    Observe,
    /// Rejected records are removed from the batch
    Drop,
}

impl LimitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitPolicy::Observe => "observe",
            LimitPolicy::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub disabled: bool,
    pub max_series: usize,
    pub rotation_interval: Duration,
    pub on_limit: LimitPolicy,
    /// Parent of the rotation task's token; the start-up token when `None`
    pub parent_token: Option<CancellationToken>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            max_series: DEFAULT_MAX_SERIES,
            rotation_interval: Duration::from_secs(DEFAULT_ROTATION_INTERVAL_SECS),
            on_limit: LimitPolicy::default(),
            parent_token: None,
        }
    }
}

/// Outcome of one admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Series already admitted in this window
    Tracked,
    /// New series, within budget
    Admitted,
    /// New series, budget exhausted
    Rejected,
    /// Internal error; treated as admitted
    FailedOpen(LimiterError),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

struct SeriesWindow {
    generation: u64,
    fingerprints: FxHashSet<Fingerprint>,
}

pub struct MetricsLimiter {
    max_series: usize,
    rotation_interval: Duration,
    on_limit: LimitPolicy,
    generation: AtomicU64,
    windows: DashMap<String, Arc<Mutex<SeriesWindow>>>,
    rotation: OnceLock<BackgroundTask>,
}

impl MetricsLimiter {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            max_series: config.max_series,
            rotation_interval: config.rotation_interval,
            on_limit: config.on_limit,
            generation: AtomicU64::new(0),
            windows: DashMap::new(),
            rotation: OnceLock::new(),
        }
    }

    pub fn policy(&self) -> LimitPolicy {
        self.on_limit
    }

    pub fn max_series(&self) -> usize {
        self.max_series
    }

    /// Admit one series of `metric_name`. Resource attributes are not part
    /// of the series identity.
    pub fn admit(
        &self,
        metric_name: &str,
        attrs: &[KeyValue],
        _resource_attrs: &[KeyValue],
    ) -> Admission {
        if metric_name.is_empty() {
            return Admission::FailedOpen(LimiterError::EmptyMetricName);
        }

        let id = fingerprint(attrs);
        let window = self.window(metric_name);
        let mut window = window.lock();

        // Read under the window lock so a concurrent rotation is either fully
        // seen or not at all
        let generation = self.generation.load(Ordering::Acquire);
        if window.generation < generation {
            window.generation = generation;
            window.fingerprints.clear();
        }

        if window.fingerprints.contains(&id) {
            Admission::Tracked
        } else if window.fingerprints.len() < self.max_series {
            window.fingerprints.insert(id);
            Admission::Admitted
        } else {
            Admission::Rejected
        }
    }

    /// Arc is cloned out so the map shard is not held while the window is locked
    fn window(&self, metric_name: &str) -> Arc<Mutex<SeriesWindow>> {
        if let Some(window) = self.windows.get(metric_name) {
            return Arc::clone(window.value());
        }
        let generation = self.generation.load(Ordering::Acquire);
        Arc::clone(
            self.windows
                .entry(metric_name.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(SeriesWindow {
                        generation,
                        fingerprints: FxHashSet::default(),
                    }))
                })
                .value(),
        )
    }

    /// Start a new window for every metric name.
    ///
    /// Windows idle for two full generations and not held by an in-flight
    /// admission are evicted.
    pub fn rotate(&self) {
        let current = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let before = self.windows.len();

        self.windows.retain(|_, window| {
            if Arc::strong_count(window) > 1 {
                return true;
            }
            match window.try_lock() {
                Some(w) => w.generation + 1 >= current,
                None => true,
            }
        });

        tracing::debug!(
            generation = current,
            evicted = before.saturating_sub(self.windows.len()),
            metrics = self.windows.len(),
            "Cardinality window rotated"
        );
    }

    /// Series admitted for `metric_name` in the current window
    pub fn series_count(&self, metric_name: &str) -> usize {
        let Some(window) = self.windows.get(metric_name).map(|w| Arc::clone(w.value())) else {
            return 0;
        };
        let window = window.lock();
        if window.generation < self.generation.load(Ordering::Acquire) {
            0
        } else {
            window.fingerprints.len()
        }
    }

    /// Number of metric names currently holding a window
    pub fn metric_count(&self) -> usize {
        self.windows.len()
    }

    /// Spawn the rotation task as a child of `parent`.
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        if self.rotation_interval.is_zero() {
            tracing::warn!("Limiter rotation interval is zero, rotation disabled");
            return;
        }

        self.rotation.get_or_init(|| {
            let token = parent.child_token();
            let observed = token.clone();
            let limiter: Weak<Self> = Arc::downgrade(self);
            let interval = self.rotation_interval;

            BackgroundTask::spawn(COMPONENT, token, async move {
                let mut timer = tokio::time::interval(interval);
                timer.tick().await; // Skip immediate first tick

                loop {
                    tokio::select! {
                        biased;
                        _ = observed.cancelled() => break,
                        _ = timer.tick() => match limiter.upgrade() {
                            Some(limiter) => limiter.rotate(),
                            None => break,
                        },
                    }
                }
            })
        });
    }
}

#[async_trait]
impl Stopper for MetricsLimiter {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    async fn stop(&self, ctx: &CancellationToken) -> Result<(), StopError> {
        match self.rotation.get() {
            Some(task) => task.stop(ctx).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;
