use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Error;
use crate::Result;
use crate::StorageError;

/// Runs `task` until it succeeds, doubling the pause between attempts.
///
/// Every attempt is bounded by `policy.timeout_ms`. With `max_retries == 0`
/// the task is retried until it succeeds; otherwise the last error is
/// returned once `max_retries` attempts have failed.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
{
    let timeout_duration = Duration::from_millis(policy.timeout_ms);
    let mut attempt = 0;
    loop {
        let last_error = match timeout(timeout_duration, task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) => {
                warn!(attempt, "task failed with error: {:?}", e);
                e
            }
            Err(_) => {
                warn!(attempt, "task timed out after {:?}", timeout_duration);
                Error::Storage(StorageError::Unavailable(format!(
                    "timed out after {:?}",
                    timeout_duration
                )))
            }
        };

        attempt += 1;
        if policy.max_retries > 0 && attempt >= policy.max_retries {
            warn!("task failed after {} attempts", attempt);
            return Err(last_error);
        }
        sleep(policy.delay_for_attempt(attempt - 1)).await;
    }
}

/// Spawns a named background task, logging its error if it fails.
pub(crate) fn spawn_task<Fut>(
    name: &str,
    task: Fut,
    handles: Option<&mut Vec<JoinHandle<()>>>,
) where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
