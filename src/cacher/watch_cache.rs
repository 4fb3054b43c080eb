//! Versioned ring buffer
//!
//! Keeps the most recent mutations of a resource prefix in a ring buffer
//! indexed by absolute, monotonically increasing indices (slot = index %
//! capacity), next to a key/value store holding the latest state of every
//! object. All mutations go through one write lock; the event handler is
//! invoked before that lock is released so the dispatcher observes events in
//! buffer order.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::watch_cache_interval::WatchCacheInterval;
use crate::has_path_prefix;
use crate::metrics::CAPACITY;
use crate::metrics::EVENTS_RECEIVED_TOTAL;
use crate::object_key;
use crate::CacheError;
use crate::EventType;
use crate::Fields;
use crate::Labels;
use crate::Object;
use crate::Result;
use crate::WatchCacheConfig;
use crate::WatchCacheEvent;

/// What the watch cache hands to the dispatcher.
#[derive(Debug, Clone)]
pub(crate) enum CacheUpdate {
    Event(Arc<WatchCacheEvent>),
    /// Retained history was dropped; watchers of older generations missed events
    HistoryReset { generation: u64 },
}

pub(crate) type EventHandler = Box<dyn Fn(CacheUpdate) + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct StoreElement {
    pub(crate) key: String,
    pub(crate) object: Arc<Object>,
    pub(crate) labels: Labels,
    pub(crate) fields: Fields,
}

impl StoreElement {
    fn new(
        key: String,
        object: Arc<Object>,
    ) -> Self {
        let labels = object.labels().clone();
        let fields = object.field_set();
        Self {
            key,
            object,
            labels,
            fields,
        }
    }
}

pub(crate) struct WatchCacheInner {
    cache: Vec<Option<Arc<WatchCacheEvent>>>,
    capacity: usize,
    /// Index of the oldest retained event
    start_index: u64,
    /// Index the next event will be written to
    end_index: u64,
    store: BTreeMap<String, StoreElement>,
    resource_version: u64,
    /// Version of the last list the store was seeded from
    list_resource_version: u64,
    /// `start_index` right after the last seed or history reset; differs from
    /// `start_index` once an event has been evicted since
    history_start_index: u64,
    history_generation: u64,
    initialized: bool,
}

impl WatchCacheInner {
    fn new(capacity: usize) -> Self {
        Self {
            cache: vec![None; capacity],
            capacity,
            start_index: 0,
            end_index: 0,
            store: BTreeMap::new(),
            resource_version: 0,
            list_resource_version: 0,
            history_start_index: 0,
            history_generation: 0,
            initialized: false,
        }
    }

    pub(crate) fn start_index(&self) -> u64 {
        self.start_index
    }

    #[cfg(test)]
    pub(crate) fn end_index(&self) -> u64 {
        self.end_index
    }

    pub(crate) fn resource_version(&self) -> u64 {
        self.resource_version
    }

    pub(crate) fn history_generation(&self) -> u64 {
        self.history_generation
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        (self.end_index - self.start_index) as usize
    }

    pub(crate) fn event_at(
        &self,
        index: u64,
    ) -> Option<Arc<WatchCacheEvent>> {
        if index < self.start_index || index >= self.end_index {
            return None;
        }
        self.cache[self.slot(index)].clone()
    }

    fn slot(
        &self,
        index: u64,
    ) -> usize {
        (index % self.capacity as u64) as usize
    }

    fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Store entries under `key`: the exact key, or every key below it when recursive.
    fn store_range<'a>(
        &'a self,
        key: &'a str,
        recursive: bool,
    ) -> impl Iterator<Item = &'a StoreElement> + 'a {
        let prefix = key.trim_end_matches('/');
        self.store
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .filter(move |(k, _)| {
                if recursive {
                    has_path_prefix(k, prefix)
                } else {
                    k.as_str() == key
                }
            })
            .map(|(_, elem)| elem)
    }

    fn resize_locked(
        &mut self,
        event_time: Instant,
        config: &WatchCacheConfig,
    ) {
        if !self.is_full() {
            return;
        }
        let fresh = config.event_fresh_duration();

        let oldest = self.cache[self.slot(self.start_index)].as_ref().map(|e| e.record_time);
        if let Some(oldest) = oldest {
            if event_time.saturating_duration_since(oldest) < fresh {
                let capacity = (self.capacity * 2).min(config.upper_bound_capacity);
                if capacity > self.capacity {
                    self.do_resize(capacity);
                }
                return;
            }
        }

        let quarter_back = self.end_index - (self.capacity / 4) as u64;
        let quarter = self.cache[self.slot(quarter_back)].as_ref().map(|e| e.record_time);
        if let Some(quarter) = quarter {
            if event_time.saturating_duration_since(quarter) > fresh {
                let capacity = (self.capacity / 2).max(config.lower_bound_capacity);
                if capacity < self.capacity {
                    self.do_resize(capacity);
                }
            }
        }
    }

    fn do_resize(
        &mut self,
        capacity: usize,
    ) {
        if capacity < self.capacity {
            // shrinking keeps the newest events
            self.start_index = self.end_index.saturating_sub(capacity as u64).max(self.start_index);
        }
        let mut cache = vec![None; capacity];
        for index in self.start_index..self.end_index {
            let slot = self.slot(index);
            cache[(index % capacity as u64) as usize] = self.cache[slot].take();
        }
        debug!(from = self.capacity, to = capacity, "resizing watch cache");
        self.cache = cache;
        self.capacity = capacity;
    }

    fn update_cache(
        &mut self,
        event: Arc<WatchCacheEvent>,
        config: &WatchCacheConfig,
    ) {
        self.resize_locked(event.record_time, config);
        if self.is_full() {
            let slot = self.slot(self.start_index);
            self.cache[slot] = None;
            self.start_index += 1;
        }
        let slot = self.slot(self.end_index);
        self.cache[slot] = Some(event);
        self.end_index += 1;
    }

    /// Drops the retained history without touching the store.
    fn reset_history(&mut self) {
        for index in self.start_index..self.end_index {
            let slot = self.slot(index);
            self.cache[slot] = None;
        }
        self.start_index = self.end_index;
        self.history_start_index = self.start_index;
        self.history_generation += 1;
    }
}

pub(crate) struct WatchCache {
    inner: Arc<RwLock<WatchCacheInner>>,
    prefix: String,
    config: WatchCacheConfig,
    event_handler: EventHandler,
    resource_version_tx: watch::Sender<u64>,
}

impl WatchCache {
    pub(crate) fn new(
        prefix: &str,
        config: WatchCacheConfig,
        event_handler: EventHandler,
    ) -> Self {
        let (resource_version_tx, _) = watch::channel(0);
        CAPACITY
            .with_label_values(&[prefix])
            .set(config.lower_bound_capacity as i64);
        Self {
            inner: Arc::new(RwLock::new(WatchCacheInner::new(config.lower_bound_capacity))),
            prefix: prefix.to_string(),
            config,
            event_handler,
            resource_version_tx,
        }
    }

    pub(crate) fn add(
        &self,
        obj: Object,
    ) {
        self.process_event(EventType::Added, obj);
    }

    pub(crate) fn update(
        &self,
        obj: Object,
    ) {
        self.process_event(EventType::Modified, obj);
    }

    /// `obj` carries the deletion's resource version; the recorded payload is
    /// the last stored state stamped with that version.
    pub(crate) fn delete(
        &self,
        obj: Object,
    ) {
        self.process_event(EventType::Deleted, obj);
    }

    fn process_event(
        &self,
        event_type: EventType,
        obj: Object,
    ) {
        let key = object_key(&self.prefix, &obj);
        let resource_version = obj.resource_version();

        let mut inner = self.inner.write();
        if resource_version <= inner.resource_version {
            warn!(
                key = %key,
                resource_version,
                current = inner.resource_version,
                "ignoring {} event that does not advance the watch cache",
                event_type.as_str()
            );
            return;
        }

        let prev = inner.store.get(&key).map(|elem| elem.object.clone());
        let event = match event_type {
            EventType::Deleted => {
                let mut last = prev.as_deref().cloned().unwrap_or(obj);
                last.meta.resource_version = resource_version;
                WatchCacheEvent::new(event_type, key.clone(), Arc::new(last), prev, resource_version)
            }
            _ => WatchCacheEvent::new(event_type, key.clone(), Arc::new(obj), prev, resource_version),
        };
        let event = Arc::new(event);

        self.apply_event_locked(&mut inner, event);
    }

    fn apply_event_locked(
        &self,
        inner: &mut WatchCacheInner,
        event: Arc<WatchCacheEvent>,
    ) {
        trace!(key = %event.key, rv = event.resource_version, "watch cache {}", event.event_type.as_str());

        let before = inner.capacity;
        inner.update_cache(event.clone(), &self.config);
        if inner.capacity != before {
            CAPACITY.with_label_values(&[&self.prefix]).set(inner.capacity as i64);
        }

        match event.event_type {
            EventType::Deleted => {
                inner.store.remove(&event.key);
            }
            EventType::Added | EventType::Modified => {
                inner
                    .store
                    .insert(event.key.clone(), StoreElement::new(event.key.clone(), event.object.clone()));
            }
            EventType::Bookmark => {}
        }

        inner.resource_version = event.resource_version;
        EVENTS_RECEIVED_TOTAL.with_label_values(&[&self.prefix]).inc();
        (self.event_handler)(CacheUpdate::Event(event));
        self.resource_version_tx.send_replace(inner.resource_version);
    }

    /// Advances the clock without a mutation.
    pub(crate) fn update_resource_version(
        &self,
        resource_version: u64,
    ) {
        let mut inner = self.inner.write();
        if resource_version <= inner.resource_version {
            return;
        }
        inner.resource_version = resource_version;
        (self.event_handler)(CacheUpdate::Event(Arc::new(WatchCacheEvent::bookmark(resource_version))));
        self.resource_version_tx.send_replace(resource_version);
    }

    /// Seeds the cache from a full list, or reconciles it with a later one.
    ///
    /// Objects that appeared or changed since the current state are recorded
    /// as Added/Modified events in resource version order. Deletions cannot be
    /// placed in that order, so discovering any drops the retained history and
    /// starts a new history generation.
    pub(crate) fn replace(
        &self,
        objects: Vec<Object>,
        resource_version: u64,
    ) {
        let mut incoming: BTreeMap<String, Object> = BTreeMap::new();
        for obj in objects {
            incoming.insert(object_key(&self.prefix, &obj), obj);
        }

        let mut inner = self.inner.write();

        if !inner.initialized {
            inner.store = incoming
                .into_iter()
                .map(|(key, obj)| (key.clone(), StoreElement::new(key, Arc::new(obj))))
                .collect();
            inner.start_index = inner.end_index;
            inner.history_start_index = inner.start_index;
            inner.list_resource_version = resource_version;
            inner.resource_version = resource_version;
            inner.initialized = true;
            info!(prefix = %self.prefix, resource_version, objects = inner.store.len(), "watch cache seeded");
            self.finish_replace_locked(&inner, resource_version);
            return;
        }

        let deleted = inner.store.keys().filter(|k| !incoming.contains_key(*k)).count();
        let mut changed: Vec<(EventType, String, Object, Option<Arc<Object>>)> = Vec::new();
        for (key, obj) in incoming.iter() {
            match inner.store.get(key) {
                None => changed.push((EventType::Added, key.clone(), obj.clone(), None)),
                Some(elem) if elem.object.resource_version() != obj.resource_version() => {
                    changed.push((EventType::Modified, key.clone(), obj.clone(), Some(elem.object.clone())))
                }
                Some(_) => {}
            }
        }
        changed.sort_by_key(|(_, _, obj, _)| obj.resource_version());

        let current = inner.resource_version;
        let out_of_order = changed.first().is_some_and(|(_, _, obj, _)| obj.resource_version() <= current);

        if deleted > 0 || out_of_order || resource_version < current {
            inner.reset_history();
            inner.store = incoming
                .into_iter()
                .map(|(key, obj)| (key.clone(), StoreElement::new(key, Arc::new(obj))))
                .collect();
            inner.list_resource_version = resource_version;
            inner.resource_version = resource_version;
            warn!(
                prefix = %self.prefix,
                deleted,
                generation = inner.history_generation,
                "relist could not be merged into history, resetting"
            );
            (self.event_handler)(CacheUpdate::HistoryReset {
                generation: inner.history_generation,
            });
            self.finish_replace_locked(&inner, resource_version);
            return;
        }

        let merged = changed.len();
        for (event_type, key, obj, prev) in changed {
            let rv = obj.resource_version();
            let event = Arc::new(WatchCacheEvent::new(event_type, key, Arc::new(obj), prev, rv));
            self.apply_event_locked(&mut inner, event);
        }
        inner.resource_version = inner.resource_version.max(resource_version);
        info!(prefix = %self.prefix, resource_version, merged, "relist merged into watch cache");
        self.finish_replace_locked(&inner, resource_version);
    }

    fn finish_replace_locked(
        &self,
        inner: &WatchCacheInner,
        resource_version: u64,
    ) {
        (self.event_handler)(CacheUpdate::Event(Arc::new(WatchCacheEvent::bookmark(resource_version))));
        self.resource_version_tx.send_replace(inner.resource_version);
    }

    /// Waits until the cache has seen `resource_version`.
    pub(crate) async fn wait_until_fresh(
        &self,
        ctx: &CancellationToken,
        resource_version: u64,
    ) -> Result<()> {
        let mut rx = self.resource_version_tx.subscribe();
        let deadline = Instant::now() + self.config.wait_until_fresh_timeout();
        loop {
            let current = *rx.borrow_and_update();
            if current >= resource_version {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(CacheError::Cancelled.into()),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CacheError::TooLargeResourceVersion {
                        requested: resource_version,
                        current,
                    }
                    .into());
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CacheError::Stopped.into());
                    }
                }
            }
        }
    }

    /// Waits until the cache has seen `resource_version`, then snapshots the
    /// objects under `key` together with the cache's version.
    pub(crate) async fn wait_until_fresh_and_list(
        &self,
        ctx: &CancellationToken,
        resource_version: u64,
        key: &str,
        recursive: bool,
    ) -> Result<(Vec<Arc<Object>>, u64)> {
        self.wait_until_fresh(ctx, resource_version).await?;
        let inner = self.inner.read();
        let items = inner.store_range(key, recursive).map(|elem| elem.object.clone()).collect();
        Ok((items, inner.resource_version))
    }

    pub(crate) async fn wait_until_fresh_and_get(
        &self,
        ctx: &CancellationToken,
        resource_version: u64,
        key: &str,
    ) -> Result<(Option<Arc<Object>>, u64)> {
        self.wait_until_fresh(ctx, resource_version).await?;
        let inner = self.inner.read();
        let item = inner.store.get(key).map(|elem| elem.object.clone());
        Ok((item, inner.resource_version))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, WatchCacheInner> {
        self.inner.read()
    }

    /// Interval a watcher starting after `resource_version` replays.
    ///
    /// Must be called with `inner` being this cache's read guard. A watch that
    /// asks for initial events, or a legacy `resource_version == 0` watch,
    /// replays the current store; otherwise the retained events newer than
    /// `resource_version` are replayed.
    pub(crate) fn get_all_events_since_locked(
        &self,
        inner: &WatchCacheInner,
        resource_version: u64,
        key: &str,
        recursive: bool,
        send_initial_events: Option<bool>,
    ) -> Result<WatchCacheInterval> {
        if send_initial_events == Some(true) {
            return Ok(self.interval_from_store_locked(inner, key, recursive));
        }

        let resource_version = match (resource_version, send_initial_events) {
            (0, None) => return Ok(self.interval_from_store_locked(inner, key, recursive)),
            (0, _) => inner.resource_version,
            (rv, _) => rv,
        };

        let oldest = if inner.start_index == inner.history_start_index {
            inner.list_resource_version.saturating_add(1)
        } else {
            match inner.event_at(inner.start_index) {
                Some(event) => event.resource_version,
                None => inner.list_resource_version.saturating_add(1),
            }
        };
        if resource_version < oldest.saturating_sub(1) {
            return Err(CacheError::CacheIncomplete {
                requested: resource_version,
                oldest: oldest - 1,
            }
            .into());
        }

        // smallest index whose event is newer than `resource_version`
        let (mut lo, mut hi) = (inner.start_index, inner.end_index);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let newer = inner.event_at(mid).is_some_and(|e| e.resource_version > resource_version);
            if newer {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        Ok(WatchCacheInterval::from_buffer(
            self.inner.clone(),
            lo,
            inner.end_index,
            inner.resource_version,
        ))
    }

    fn interval_from_store_locked(
        &self,
        inner: &WatchCacheInner,
        key: &str,
        recursive: bool,
    ) -> WatchCacheInterval {
        let events = inner
            .store_range(key, recursive)
            .map(|elem| {
                Arc::new(WatchCacheEvent::added_from_store(
                    elem.key.clone(),
                    elem.object.clone(),
                    elem.labels.clone(),
                    elem.fields.clone(),
                ))
            })
            .collect();
        WatchCacheInterval::from_store(events, inner.resource_version)
    }

    pub(crate) fn resource_version(&self) -> u64 {
        self.inner.read().resource_version
    }
}
