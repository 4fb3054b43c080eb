use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::BackoffPolicy;
use crate::BookmarkConfig;
use crate::CacherConfig;
use crate::Object;

pub(crate) const TEST_PREFIX: &str = "/registry/pods";

/// Configuration with short delays so reflector retries and bookmarks happen
/// within a test's lifetime.
pub(crate) fn test_config() -> CacherConfig {
    let mut config = CacherConfig {
        resource_prefix: TEST_PREFIX.to_string(),
        ..Default::default()
    };
    config.reflector.relist_delay_ms = 50;
    config.reflector.backoff = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 1000,
        base_delay_ms: 10,
        max_delay_ms: 100,
    };
    config.bookmark = BookmarkConfig {
        frequency_ms: 1000,
        tick_interval_ms: 100,
        tick_jitter_factor: 0.0,
    };
    config
}

pub(crate) fn pod(
    namespace: &str,
    name: &str,
) -> Object {
    Object::new(Some(namespace), name)
}

/// Polls `condition` until it holds, panicking after `timeout`.
pub(crate) async fn wait_until<F>(
    timeout: Duration,
    mut condition: F,
) where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `fut`, panicking if it does not finish within `timeout`.
pub(crate) async fn within<F: Future>(
    timeout: Duration,
    fut: F,
) -> F::Output {
    match tokio::time::timeout(timeout, fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {:?}", timeout),
    }
}
