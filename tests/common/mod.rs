use std::future::Future;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use d_watch_cache::BackoffPolicy;
use d_watch_cache::BookmarkConfig;
use d_watch_cache::Cacher;
use d_watch_cache::CacherConfig;
use d_watch_cache::MemStore;
use d_watch_cache::Object;
use d_watch_cache::WatchEvent;
use d_watch_cache::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const PREFIX: &str = "/registry/pods";
pub const WAIT: Duration = Duration::from_secs(5);

static LOGGER_INIT: Once = Once::new();

pub fn enable_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> CacherConfig {
    let mut config = CacherConfig {
        resource_prefix: PREFIX.to_string(),
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

pub fn pod(
    namespace: &str,
    name: &str,
) -> Object {
    Object::new(Some(namespace), name)
}

pub fn seeded_store(names: &[&str]) -> Arc<MemStore> {
    let store = Arc::new(MemStore::new(PREFIX));
    for name in names {
        store.create(pod("default", name)).expect("seed");
    }
    store
}

pub async fn ready_cacher(
    store: Arc<MemStore>,
    config: CacherConfig,
) -> Cacher {
    let cacher = Cacher::new(config, store).expect("cacher");
    within(cacher.ready().wait(&CancellationToken::new()))
        .await
        .expect("ready");
    cacher
}

/// Waits until the cache has applied every change up to `resource_version`.
pub async fn caught_up(
    cacher: &Cacher,
    resource_version: u64,
) {
    wait_until(|| cacher.resource_version() >= resource_version).await;
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {:?}", WAIT),
    }
}

pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub async fn next_event(stream: &mut WatchStream) -> WatchEvent {
    within(stream.recv()).await.expect("watch stream ended")
}

/// Next event that is not a bookmark.
pub async fn next_change(stream: &mut WatchStream) -> WatchEvent {
    loop {
        let event = next_event(stream).await;
        if !matches!(event, WatchEvent::Bookmark(_)) {
            return event;
        }
    }
}

/// Reads until the stream ends.
pub async fn drain(stream: &mut WatchStream) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    while let Some(event) = within(stream.recv()).await {
        events.push(event);
    }
    events
}
