use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::error;

use crate::BackoffPolicy;
use crate::Result;
use crate::StorageError;

/// Exponential backoff with jitter driven by a [`BackoffPolicy`].
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    attempts: usize,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Failed attempts recorded so far
    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` once `max_retries` attempts have been used up.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_retries != 0 && self.attempts >= self.policy.max_retries {
            return None;
        }
        self.attempts += 1;

        let shift = (self.attempts - 1).min(20) as u32;
        let ceiling = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.policy.max_delay_ms);

        // Equal jitter: half fixed, half random
        let delay_ms = if ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(ceiling / 2..=ceiling)
        };
        Some(Duration::from_millis(delay_ms))
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Deadline for a single attempt
    pub(crate) fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.policy.timeout_ms)
    }
}

/// Bounds `fut` by `duration`; an elapsed deadline is reported as `Unavailable`.
pub(crate) async fn with_timeout<F, T>(
    duration: Duration,
    operation: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Unavailable(format!(
            "{operation} did not complete within {duration:?}"
        ))
        .into()),
    }
}

// Helper function to spawn long running tasks and log how they ended
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    })
}
