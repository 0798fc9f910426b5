//! Background task ownership and coordinated stop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::constants::STOP_TIMEOUT_SECS;
use crate::domain::error::StopError;

/// A component owning background resources that must be released on shutdown
#[async_trait]
pub trait Stopper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Release background resources. Idempotent.
    ///
    /// Returns early with [`StopError::Cancelled`] when `ctx` is cancelled
    /// before the task finishes.
    async fn stop(&self, ctx: &CancellationToken) -> Result<(), StopError>;
}

/// One spawned task bound to its own cancellation token
pub struct BackgroundTask {
    component: &'static str,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawn `task` on the current runtime. `token` must be the one the task observes.
    pub fn spawn<F>(component: &'static str, token: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            component,
            token,
            handle: Mutex::new(Some(tokio::spawn(task))),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel the task and wait for it, bounded by [`STOP_TIMEOUT_SECS`]
    pub async fn stop(&self, ctx: &CancellationToken) -> Result<(), StopError> {
        self.token.cancel();

        let Some(mut handle) = self.handle.lock().take() else {
            return Ok(());
        };

        let timeout = tokio::time::sleep(Duration::from_secs(STOP_TIMEOUT_SECS));
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                handle.abort();
                Err(StopError::Cancelled { component: self.component })
            }
            result = &mut handle => result.map_err(|e| StopError::Join {
                component: self.component,
                message: e.to_string(),
            }),
            _ = timeout => {
                handle.abort();
                Err(StopError::Timeout { component: self.component, secs: STOP_TIMEOUT_SECS })
            }
        }
    }
}

/// Stop every stopper concurrently, logging and collecting failures
pub async fn stop_all(stoppers: &[Arc<dyn Stopper>], ctx: &CancellationToken) -> Vec<StopError> {
    tracing::debug!(count = stoppers.len(), "Stopping background components");

    let results = futures::future::join_all(stoppers.iter().map(|s| async move {
        let result = s.stop(ctx).await;
        (s.name(), result)
    }))
    .await;

    results
        .into_iter()
        .filter_map(|(name, result)| match result {
            Ok(()) => {
                tracing::debug!(component = name, "Stopped");
                None
            }
            Err(e) => {
                tracing::error!(component = name, error = %e, "Failed to stop");
                Some(e)
            }
        })
        .collect()
}
