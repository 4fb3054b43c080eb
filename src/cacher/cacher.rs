//! Cache façade
//!
//! Serves `get`, `get_list` and `watch` for one resource prefix from the
//! watch cache when the request's resource version semantics allow it, and
//! forwards everything else to the backing store unchanged.
//!
//! Background tasks owned by a [`Cacher`]:
//! - the reflector, keeping the watch cache in sync with the store
//! - the dispatcher, fanning recorded events out to cache watchers and
//!   sending periodic bookmarks
//! - one task per cache watcher, replaying its initial interval and
//!   forwarding live events to the client

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::bookmark_timer::BookmarkTimer;
use super::cache_watcher::CacheWatcher;
use super::cache_watcher::WatcherParams;
use super::incoming::IncomingQueue;
use super::incoming::IncomingReceiver;
use super::ready::Ready;
use super::reflector::Reflector;
use super::reflector::ReflectorState;
use super::resource_version_policy::bookmark_after_resource_version;
use super::resource_version_policy::start_watch_resource_version;
use super::time_budget::TimeBudget;
use super::time_bucket_watchers::TimeBucketWatchers;
use super::watch_cache::CacheUpdate;
use super::watch_cache::WatchCache;
use super::watcher_registry::IndexedWatchers;
use super::watcher_registry::NamespacedName;
use crate::metrics::BYPASSED_REQUESTS_TOTAL;
use crate::metrics::EVENTS_DISPATCHED_TOTAL;
use crate::metrics::REGISTERED_WATCHERS;
use crate::metrics::TERMINATED_WATCHERS_TOTAL;
use crate::object_key;
use crate::parse_resource_version;
use crate::spawn_task;
use crate::CacheError;
use crate::CacherConfig;
use crate::Error;
use crate::EventType;
use crate::GetOptions;
use crate::ListOptions;
use crate::Object;
use crate::ObjectList;
use crate::ResourceVersionMatch;
use crate::Result;
use crate::Storage;
use crate::StorageError;
use crate::WatchCacheEvent;
use crate::WatchStream;

struct CacherState {
    watchers: IndexedWatchers,
    bookmark_watchers: TimeBucketWatchers,
    next_watcher_id: u64,
}

struct CacherShared {
    config: CacherConfig,
    prefix: String,
    storage: Arc<dyn Storage>,
    watch_cache: Arc<WatchCache>,
    ready: Arc<Ready>,
    /// Lock order: watch cache read lock first, then this
    state: Mutex<CacherState>,
    budget: TimeBudget,
    shutdown_tx: watch::Sender<()>,
    stopped: AtomicBool,
    reflector_state: watch::Receiver<ReflectorState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Watch cache in front of a [`Storage`] for one resource prefix.
///
/// Must be created inside a Tokio runtime. Dropping the cacher stops it.
pub struct Cacher {
    shared: Arc<CacherShared>,
}

impl Cacher {
    pub fn new(
        config: CacherConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let prefix = config.resource_prefix.clone();

        let (incoming, incoming_rx) = IncomingQueue::new(config.dispatch.incoming_buffer_size);
        let event_sink = incoming.clone();
        let watch_cache = Arc::new(WatchCache::new(
            &prefix,
            config.watch_cache.clone(),
            Box::new(move |update| event_sink.push(update)),
        ));
        let ready = Arc::new(Ready::new());
        let (shutdown_tx, _) = watch::channel(());
        let (state_tx, state_rx) = watch::channel(ReflectorState::Pending);

        let shared = Arc::new(CacherShared {
            prefix: prefix.clone(),
            storage: storage.clone(),
            watch_cache: watch_cache.clone(),
            ready: ready.clone(),
            state: Mutex::new(CacherState {
                watchers: IndexedWatchers::default(),
                bookmark_watchers: TimeBucketWatchers::new(config.bookmark.frequency()),
                next_watcher_id: 1,
            }),
            budget: TimeBudget::new(
                config.dispatch.timeout_budget_max(),
                config.dispatch.timeout_budget_refresh_per_second(),
            ),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            reflector_state: state_rx,
            handles: Mutex::new(Vec::new()),
            config,
        });

        let reflector = Reflector::new(
            &prefix,
            storage,
            watch_cache,
            ready,
            incoming,
            shared.config.reflector.clone(),
            state_tx,
        );

        let mut handles = Vec::new();
        spawn_task(
            "reflector",
            reflector.run(shared.shutdown_tx.subscribe()),
            Some(&mut handles),
        );
        spawn_task(
            "dispatcher",
            dispatch_loop(shared.clone(), incoming_rx, shared.shutdown_tx.subscribe()),
            Some(&mut handles),
        );
        *shared.handles.lock() = handles;

        info!(prefix = %prefix, "cacher started");
        Ok(Self { shared })
    }

    pub fn ready(&self) -> &Ready {
        &self.shared.ready
    }

    pub fn reflector_state(&self) -> ReflectorState {
        *self.shared.reflector_state.borrow()
    }

    /// Version the watch cache has caught up to.
    pub fn resource_version(&self) -> u64 {
        self.shared.watch_cache.resource_version()
    }

    /// Registered cache watchers.
    pub fn watcher_count(&self) -> usize {
        self.shared.state.lock().watchers.len()
    }

    /// Cache watchers currently scheduled for a bookmark.
    pub fn bookmark_watcher_count(&self) -> usize {
        self.shared.state.lock().bookmark_watchers.len()
    }

    pub async fn get(
        &self,
        ctx: &CancellationToken,
        key: &str,
        opts: &GetOptions,
    ) -> Result<Option<Object>> {
        let shared = &self.shared;
        shared.check_stopped()?;

        let wait_resource_version = if opts.resource_version.is_empty() {
            if !shared.config.consistent_reads_from_cache {
                shared.record_bypass("get");
                return shared.storage.get(key, opts).await;
            }
            shared.ready.check()?;
            shared.storage.current_resource_version().await?
        } else {
            let parsed = parse_resource_version(&opts.resource_version)?;
            if parsed != 0 {
                shared.record_bypass("get");
                return shared.storage.get(key, opts).await;
            }
            shared.ready.check()?;
            0
        };

        let (obj, _) = shared
            .watch_cache
            .wait_until_fresh_and_get(ctx, wait_resource_version, key)
            .await?;
        match obj {
            Some(obj) => Ok(Some((*obj).clone())),
            None if opts.ignore_not_found => Ok(None),
            None => Err(StorageError::NotFound { key: key.to_string() }.into()),
        }
    }

    pub async fn get_list(
        &self,
        ctx: &CancellationToken,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList> {
        let shared = &self.shared;
        shared.check_stopped()?;

        let predicate = &opts.predicate;
        let rv = opts.resource_version.as_str();
        let parsed = parse_resource_version(rv)?;
        // only "0" (or an unset version with consistent reads) is cache eligible
        let delegate = (rv.is_empty() && !shared.config.consistent_reads_from_cache)
            || parsed != 0
            || predicate.continue_key.is_some()
            || (predicate.limit > 0 && rv.is_empty())
            || opts.resource_version_match == Some(ResourceVersionMatch::Exact);
        if delegate {
            shared.record_bypass("list");
            return shared.storage.get_list(key, opts).await;
        }

        shared.ready.check()?;
        let wait_resource_version = if rv.is_empty() {
            shared.storage.current_resource_version().await?
        } else {
            0
        };

        let (objects, resource_version) = shared
            .watch_cache
            .wait_until_fresh_and_list(ctx, wait_resource_version, key, opts.recursive)
            .await?;

        let mut list = ObjectList {
            resource_version,
            ..Default::default()
        };
        for obj in objects.iter().filter(|obj| predicate.matches(obj)) {
            if predicate.limit > 0 && list.items.len() == predicate.limit {
                list.continue_key = list.items.last().map(|last| object_key(&shared.prefix, last));
                break;
            }
            list.items.push((**obj).clone());
        }
        Ok(list)
    }

    pub async fn watch(
        &self,
        ctx: &CancellationToken,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchStream> {
        let shared = &self.shared;
        shared.check_stopped()?;

        let rv = opts.resource_version.as_str();
        if opts.send_initial_events.is_none() && (rv.is_empty() || (!opts.recursive && rv != "0")) {
            shared.record_bypass("watch");
            return shared.storage.watch(key, opts).await;
        }

        let parsed = parse_resource_version(rv)?;
        shared.ready.wait(ctx).await?;
        if opts.send_initial_events == Some(true) && parsed > 0 {
            // the initial state must include the requested version
            shared.watch_cache.wait_until_fresh(ctx, parsed).await?;
        }

        let start_source = start_watch_resource_version(opts, parsed);
        let bookmark_after_source = bookmark_after_resource_version(opts, parsed);
        let storage_resource_version = if start_source.needs_storage() || bookmark_after_source.needs_storage() {
            shared.storage.current_resource_version().await?
        } else {
            0
        };
        let deadline = opts.timeout.map(|timeout| Instant::now() + timeout);

        let registered = {
            let inner = shared.watch_cache.read();
            let cache_resource_version = inner.resource_version();
            let start_resource_version = start_source
                .resolve(cache_resource_version, storage_resource_version)
                .unwrap_or_default();
            let bookmark_after = bookmark_after_source.resolve(cache_resource_version, storage_resource_version);

            match shared.watch_cache.get_all_events_since_locked(
                &inner,
                start_resource_version,
                key,
                opts.recursive,
                opts.send_initial_events,
            ) {
                Ok(interval) => {
                    let params = WatcherParams {
                        key: key.to_string(),
                        recursive: opts.recursive,
                        predicate: opts.predicate.clone(),
                        bookmark_after_resource_version: bookmark_after,
                        deadline,
                        history_generation: inner.history_generation(),
                        input_capacity: shared.config.dispatch.watcher_channel_size,
                    };
                    let (watcher, input) = shared.register_watcher(params)?;
                    // a snapshot already covers everything up to its own version
                    let start_resource_version = if interval.is_store_snapshot() {
                        start_resource_version.min(interval.resource_version())
                    } else {
                        start_resource_version
                    };
                    Some((watcher, input, interval, start_resource_version))
                }
                Err(Error::Cache(CacheError::CacheIncomplete { requested, oldest })) => {
                    debug!(requested, oldest, "watch start is no longer cached, serving from storage");
                    None
                }
                Err(e) => return Err(e),
            }
        };

        let Some((watcher, input, interval, start_resource_version)) = registered else {
            shared.record_bypass("watch");
            return shared.storage.watch(key, opts).await;
        };

        let (result_tx, result_rx) = mpsc::channel(shared.config.dispatch.watcher_channel_size);
        let id = watcher.id();
        let scope = watcher.scope().clone();
        let weak = Arc::downgrade(&self.shared);

        let on_exit = {
            let weak = weak.clone();
            let scope = scope.clone();
            Box::new(move || forget(&weak, id, &scope))
        };
        tokio::spawn(
            watcher
                .clone()
                .process_interval(interval, input, result_tx, start_resource_version, on_exit),
        );

        debug!(watcher = id, key = %key, start_resource_version, "watch served from cache");
        Ok(WatchStream::with_stop_hook(result_rx, move || {
            watcher.stop();
            forget(&weak, id, &scope);
        }))
    }

    /// Stops the cacher. Idempotent.
    ///
    /// Every registered watcher is terminated; events already delivered to a
    /// watch stream stay readable.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.shutdown_tx.send_replace(());
        shared.ready.stop();

        let watchers = {
            let mut state = shared.state.lock();
            let watchers = state.watchers.drain_all();
            for w in &watchers {
                state.bookmark_watchers.remove(w.id());
            }
            watchers
        };
        info!(prefix = %shared.prefix, watchers = watchers.len(), "cacher stopped");
        for w in watchers {
            w.stop();
        }
        REGISTERED_WATCHERS.with_label_values(&[&shared.prefix]).set(0);
    }

    /// Waits for the reflector and dispatcher to exit. Call after [`Cacher::stop`].
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background task failed: {:?}", e);
            }
        }
    }
}

impl Drop for Cacher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forget(
    weak: &Weak<CacherShared>,
    id: u64,
    scope: &NamespacedName,
) {
    if let Some(shared) = weak.upgrade() {
        shared.forget_watcher(id, scope);
    }
}

impl CacherShared {
    fn check_stopped(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CacheError::Stopped.into());
        }
        Ok(())
    }

    fn record_bypass(
        &self,
        request: &str,
    ) {
        BYPASSED_REQUESTS_TOTAL.with_label_values(&[&self.prefix, request]).inc();
    }

    fn register_watcher(
        &self,
        params: WatcherParams,
    ) -> Result<(Arc<CacheWatcher>, mpsc::Receiver<Arc<WatchCacheEvent>>)> {
        let mut state = self.state.lock();
        // checked under the lock so `stop` cannot miss this watcher
        self.check_stopped()?;

        let id = state.next_watcher_id;
        state.next_watcher_id += 1;
        let (watcher, input) = CacheWatcher::new(id, params);
        state.watchers.add(watcher.clone());
        if watcher.allow_watch_bookmarks() {
            state
                .bookmark_watchers
                .add_watcher_thread_unsafe(watcher.clone(), Instant::now());
        }
        REGISTERED_WATCHERS
            .with_label_values(&[&self.prefix])
            .set(state.watchers.len() as i64);
        Ok((watcher, input))
    }

    /// Unregisters and stops a watcher. Idempotent.
    fn forget_watcher(
        &self,
        id: u64,
        scope: &NamespacedName,
    ) {
        let mut state = self.state.lock();
        // stopped before the lock is released so dispatching never re-buckets it
        if let Some(watcher) = state.watchers.delete(id, scope) {
            watcher.stop();
        }
        state.bookmark_watchers.remove(id);
        REGISTERED_WATCHERS
            .with_label_values(&[&self.prefix])
            .set(state.watchers.len() as i64);
    }

    /// Watchers an event is offered to. For bookmarks these are the watchers
    /// whose bookmark is due; they have been taken out of their buckets.
    fn start_dispatching(
        &self,
        event: &WatchCacheEvent,
    ) -> Vec<Arc<CacheWatcher>> {
        let mut state = self.state.lock();

        if event.event_type == EventType::Bookmark {
            return state
                .bookmark_watchers
                .pop_expired_watchers_thread_unsafe(Instant::now())
                .into_iter()
                .filter(|w| !w.is_stopped())
                .collect();
        }

        let (alive, stale): (Vec<_>, Vec<_>) = state
            .watchers
            .candidates(event.object.namespace(), event.object.name())
            .into_iter()
            .partition(|w| !w.is_stopped());
        if !stale.is_empty() {
            for w in &stale {
                state.watchers.delete(w.id(), w.scope());
                state.bookmark_watchers.remove(w.id());
            }
            REGISTERED_WATCHERS
                .with_label_values(&[&self.prefix])
                .set(state.watchers.len() as i64);
        }
        alive
    }

    /// Puts bookmark watchers back into their next bucket.
    fn finish_dispatching(
        &self,
        expired: Vec<Arc<CacheWatcher>>,
    ) {
        if expired.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        for w in expired {
            if !w.is_stopped() && state.watchers.contains(w.id(), w.scope()) {
                state.bookmark_watchers.add_watcher_thread_unsafe(w, now);
            }
        }
    }

    async fn dispatch_event(
        &self,
        event: &Arc<WatchCacheEvent>,
    ) {
        let watchers = self.start_dispatching(event);

        if event.event_type == EventType::Bookmark {
            for w in &watchers {
                w.nonblocking_add(event);
            }
            self.finish_dispatching(watchers);
            return;
        }

        let blocked: Vec<_> = watchers.into_iter().filter(|w| !w.nonblocking_add(event)).collect();
        if !blocked.is_empty() {
            let started = Instant::now();
            let budget = self.budget.take_available();
            let deadline = started + budget;
            for w in blocked {
                if !w.add(event, deadline).await {
                    self.terminate_slow_watcher(&w);
                }
            }
            self.budget.return_unused(budget.saturating_sub(started.elapsed()));
        }
        EVENTS_DISPATCHED_TOTAL.with_label_values(&[&self.prefix]).inc();
    }

    fn terminate_slow_watcher(
        &self,
        watcher: &CacheWatcher,
    ) {
        TERMINATED_WATCHERS_TOTAL.with_label_values(&[&self.prefix]).inc();
        let err = CacheError::WatcherOverrun {
            watcher_id: watcher.id(),
        };
        warn!(prefix = %self.prefix, "{}", err);
        self.forget_watcher(watcher.id(), watcher.scope());
    }

    /// Stops watchers registered before the latest history reset.
    fn terminate_watchers_before(
        &self,
        generation: u64,
    ) {
        let outdated = {
            let mut state = self.state.lock();
            let outdated: Vec<_> = state
                .watchers
                .iter()
                .filter(|w| w.history_generation() < generation)
                .cloned()
                .collect();
            for w in &outdated {
                state.watchers.delete(w.id(), w.scope());
                state.bookmark_watchers.remove(w.id());
            }
            REGISTERED_WATCHERS
                .with_label_values(&[&self.prefix])
                .set(state.watchers.len() as i64);
            outdated
        };
        if !outdated.is_empty() {
            info!(
                prefix = %self.prefix,
                generation,
                watchers = outdated.len(),
                "terminating watchers after history reset"
            );
        }
        for w in outdated {
            w.stop();
        }
    }

    /// Pops due bookmark watchers and reschedules them without sending anything.
    fn requeue_expired_bookmark_watchers(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        for w in state.bookmark_watchers.pop_expired_watchers_thread_unsafe(now) {
            if !w.is_stopped() {
                state.bookmark_watchers.add_watcher_thread_unsafe(w, now);
            }
        }
    }
}

async fn dispatch_loop(
    shared: Arc<CacherShared>,
    mut incoming: IncomingReceiver,
    mut shutdown_signal: watch::Receiver<()>,
) -> Result<()> {
    let mut bookmark_timer = BookmarkTimer::new(
        Duration::from_millis(shared.config.bookmark.tick_interval_ms),
        shared.config.bookmark.tick_jitter_factor,
    );
    let mut last_processed_resource_version = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_signal.changed() => {
                info!(prefix = %shared.prefix, "dispatcher shutdown signal received");
                return Ok(());
            }
            update = incoming.recv() => match update {
                None => return Ok(()),
                Some(CacheUpdate::Event(event)) => {
                    // storage bookmarks only advance the version used for our own bookmarks
                    if event.event_type != EventType::Bookmark {
                        shared.dispatch_event(&event).await;
                    }
                    last_processed_resource_version = event.resource_version;
                }
                Some(CacheUpdate::HistoryReset { generation }) => {
                    shared.terminate_watchers_before(generation);
                }
            },
            _ = sleep_until(bookmark_timer.next_deadline()) => {
                bookmark_timer.reset();
                if last_processed_resource_version == 0 {
                    shared.requeue_expired_bookmark_watchers();
                } else {
                    let bookmark = Arc::new(WatchCacheEvent::bookmark(last_processed_resource_version));
                    shared.dispatch_event(&bookmark).await;
                }
            }
        }
    }
}
