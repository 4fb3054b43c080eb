//! Keeps the watch cache in sync with the backing store.
//!
//! Lists the resource prefix, seeds the watch cache, then follows a storage
//! watch from the list's version. Any watch failure drops readiness and
//! starts over with a fresh list after `reflector.relist_delay_ms`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::incoming::IncomingQueue;
use super::ready::Ready;
use super::watch_cache::WatchCache;
use crate::metrics::INITIALIZATIONS_TOTAL;
use crate::task_with_timeout_and_exponential_backoff;
use crate::ListOptions;
use crate::ReflectorConfig;
use crate::Result;
use crate::SelectionPredicate;
use crate::Storage;
use crate::StorageError;
use crate::WatchEvent;

/// Waiting longer than this for room in the incoming queue is logged
const SLOW_INCOMING_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorState {
    Pending,
    Listing,
    Watching,
}

pub(crate) struct Reflector {
    prefix: String,
    storage: Arc<dyn Storage>,
    watch_cache: Arc<WatchCache>,
    ready: Arc<Ready>,
    incoming: IncomingQueue,
    config: ReflectorConfig,
    state_tx: watch::Sender<ReflectorState>,
}

impl Reflector {
    pub(crate) fn new(
        prefix: &str,
        storage: Arc<dyn Storage>,
        watch_cache: Arc<WatchCache>,
        ready: Arc<Ready>,
        incoming: IncomingQueue,
        config: ReflectorConfig,
        state_tx: watch::Sender<ReflectorState>,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            storage,
            watch_cache,
            ready,
            incoming,
            config,
            state_tx,
        }
    }

    pub(crate) async fn run(
        self,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal.changed() => {
                    info!(prefix = %self.prefix, "reflector shutdown signal received");
                    return Ok(());
                }
                result = self.list_and_watch() => {
                    if let Err(e) = result {
                        warn!(prefix = %self.prefix, "list and watch failed: {}", e);
                    }
                }
            }

            self.state_tx.send_replace(ReflectorState::Pending);
            self.ready.set(false);

            tokio::select! {
                biased;
                _ = shutdown_signal.changed() => {
                    info!(prefix = %self.prefix, "reflector shutdown signal received");
                    return Ok(());
                }
                _ = sleep(self.config.relist_delay()) => {}
            }
        }
    }

    async fn list_and_watch(&self) -> Result<()> {
        self.state_tx.send_replace(ReflectorState::Listing);

        let list_opts = ListOptions::recursive("");
        let list = task_with_timeout_and_exponential_backoff(
            || self.storage.get_list(&self.prefix, &list_opts),
            self.config.backoff,
        )
        .await?;

        let resource_version = list.resource_version;
        info!(prefix = %self.prefix, resource_version, items = list.items.len(), "listed backing store");
        self.watch_cache.replace(list.items, resource_version);
        self.ready.set(true);
        INITIALIZATIONS_TOTAL.with_label_values(&[&self.prefix]).inc();

        let watch_opts = ListOptions {
            predicate: SelectionPredicate::everything().with_bookmarks(),
            ..ListOptions::recursive(&resource_version.to_string())
        };
        let mut stream = self.storage.watch(&self.prefix, &watch_opts).await?;
        self.state_tx.send_replace(ReflectorState::Watching);

        loop {
            let waiting_since = Instant::now();
            self.incoming.wait_for_capacity().await;
            let waited = waiting_since.elapsed();
            if waited > SLOW_INCOMING_THRESHOLD {
                warn!(prefix = %self.prefix, ?waited, "dispatcher is falling behind the backing store");
            }
            let Some(event) = stream.recv().await else {
                return Err(StorageError::Unavailable("watch stream closed".to_string()).into());
            };
            debug!(prefix = %self.prefix, rv = ?event.resource_version(), "applying storage event");

            match event {
                WatchEvent::Added(obj) => self.watch_cache.add(obj),
                WatchEvent::Modified(obj) => self.watch_cache.update(obj),
                WatchEvent::Deleted(obj) => self.watch_cache.delete(obj),
                WatchEvent::Bookmark(obj) => self.watch_cache.update_resource_version(obj.resource_version()),
                WatchEvent::Error(status) => {
                    return Err(StorageError::Unavailable(format!(
                        "watch error {}: {}",
                        status.code, status.message
                    ))
                    .into());
                }
            }
        }
    }
}
