use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::has_path_prefix;
use crate::object_key;
use crate::parse_resource_version;
use crate::EventType;
use crate::GetOptions;
use crate::ListOptions;
use crate::Object;
use crate::ObjectList;
use crate::Result;
use crate::SelectionPredicate;
use crate::Storage;
use crate::StorageError;
use crate::WatchEvent;
use crate::WatchStream;

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const DEFAULT_WATCH_CHANNEL_SIZE: usize = 100;

struct HistoryEntry {
    event_type: EventType,
    key: String,
    object: Object,
}

#[derive(Default)]
struct MemStoreInner {
    objects: BTreeMap<String, Object>,
    resource_version: u64,
    history: VecDeque<HistoryEntry>,
    /// Highest version no longer available for watching
    compacted: u64,
}

struct MemWatcher {
    key: String,
    recursive: bool,
    predicate: SelectionPredicate,
    allow_bookmarks: bool,
    sender: mpsc::Sender<WatchEvent>,
}

impl MemWatcher {
    fn interested_in(
        &self,
        key: &str,
        object: &Object,
    ) -> bool {
        key_in_scope(key, &self.key, self.recursive) && self.predicate.matches(object)
    }
}

fn key_in_scope(
    key: &str,
    requested: &str,
    recursive: bool,
) -> bool {
    if recursive {
        has_path_prefix(key, requested)
    } else {
        key == requested
    }
}

/// In-memory [`Storage`] with a single monotonically increasing resource version.
///
/// Every mutation bumps the version and is appended to a bounded history so
/// watches can resume from a recent version. Versions older than the history
/// are reported as compacted. Watchers that fall behind their channel are
/// disconnected, which ends their stream.
pub struct MemStore {
    prefix: String,
    inner: RwLock<MemStoreInner>,
    watchers: Arc<DashMap<u64, MemWatcher>>,
    next_watcher_id: AtomicU64,
    history_limit: usize,
    watch_channel_size: usize,

    fail_lists: AtomicUsize,
    fail_gets: AtomicUsize,
    fail_watches: AtomicUsize,
}

impl MemStore {
    pub fn new(prefix: &str) -> Self {
        Self::with_limits(prefix, DEFAULT_HISTORY_LIMIT, DEFAULT_WATCH_CHANNEL_SIZE)
    }

    pub fn with_limits(
        prefix: &str,
        history_limit: usize,
        watch_channel_size: usize,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            inner: RwLock::new(MemStoreInner::default()),
            watchers: Arc::new(DashMap::new()),
            next_watcher_id: AtomicU64::new(1),
            history_limit: history_limit.max(1),
            watch_channel_size: watch_channel_size.max(1),
            fail_lists: AtomicUsize::new(0),
            fail_gets: AtomicUsize::new(0),
            fail_watches: AtomicUsize::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key_for(
        &self,
        obj: &Object,
    ) -> String {
        object_key(&self.prefix, obj)
    }

    pub fn create(
        &self,
        obj: Object,
    ) -> Result<Object> {
        let key = self.key_for(&obj);
        let mut inner = self.inner.write();
        if inner.objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists { key }.into());
        }
        Ok(self.commit_locked(&mut inner, EventType::Added, key, obj))
    }

    pub fn update(
        &self,
        obj: Object,
    ) -> Result<Object> {
        let key = self.key_for(&obj);
        let mut inner = self.inner.write();
        if !inner.objects.contains_key(&key) {
            return Err(StorageError::NotFound { key }.into());
        }
        Ok(self.commit_locked(&mut inner, EventType::Modified, key, obj))
    }

    /// Removes the object and returns its last state stamped with the deletion version.
    pub fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Object> {
        let key = self.key_for(&Object::new(namespace, name));
        let mut inner = self.inner.write();
        let last = match inner.objects.get(&key) {
            Some(obj) => obj.clone(),
            None => return Err(StorageError::NotFound { key }.into()),
        };
        Ok(self.commit_locked(&mut inner, EventType::Deleted, key, last))
    }

    fn commit_locked(
        &self,
        inner: &mut MemStoreInner,
        event_type: EventType,
        key: String,
        mut obj: Object,
    ) -> Object {
        inner.resource_version += 1;
        obj.meta.resource_version = inner.resource_version;

        match event_type {
            EventType::Deleted => {
                inner.objects.remove(&key);
            }
            _ => {
                inner.objects.insert(key.clone(), obj.clone());
            }
        }

        inner.history.push_back(HistoryEntry {
            event_type,
            key: key.clone(),
            object: obj.clone(),
        });
        while inner.history.len() > self.history_limit {
            if let Some(evicted) = inner.history.pop_front() {
                inner.compacted = evicted.object.resource_version();
            }
        }

        trace!(key = %key, rv = inner.resource_version, "mem store commit {:?}", event_type);
        self.notify_watchers(event_type, &key, &obj);
        obj
    }

    fn notify_watchers(
        &self,
        event_type: EventType,
        key: &str,
        obj: &Object,
    ) {
        let mut lagging = Vec::new();
        for entry in self.watchers.iter() {
            if !entry.interested_in(key, obj) {
                continue;
            }
            match entry.sender.try_send(WatchEvent::from_parts(event_type, obj.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(watcher_id = *entry.key(), "mem store watcher fell behind, disconnecting");
                    lagging.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => lagging.push(*entry.key()),
            }
        }
        for id in lagging {
            self.watchers.remove(&id);
        }
    }

    /// Sends a bookmark at the current version to every watcher that asked for them.
    pub fn send_bookmark(&self) {
        let inner = self.inner.read();
        let rv = inner.resource_version;
        for entry in self.watchers.iter() {
            if entry.allow_bookmarks {
                let _ = entry.sender.try_send(WatchEvent::Bookmark(Object::bookmark(rv)));
            }
        }
    }

    /// Disconnects every watcher, ending their streams.
    pub fn close_watchers(&self) {
        debug!(count = self.watchers.len(), "closing all mem store watchers");
        self.watchers.clear();
    }

    /// Drops the whole history; watches can only start from the current version afterwards.
    pub fn compact(&self) {
        let mut inner = self.inner.write();
        inner.history.clear();
        inner.compacted = inner.resource_version;
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn fail_next_lists(
        &self,
        n: usize,
    ) {
        self.fail_lists.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_gets(
        &self,
        n: usize,
    ) {
        self.fail_gets.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_watches(
        &self,
        n: usize,
    ) {
        self.fail_watches.store(n, Ordering::SeqCst);
    }
}

fn take_injected_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Storage for MemStore {
    async fn get(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<Option<Object>> {
        if take_injected_failure(&self.fail_gets) {
            return Err(StorageError::Unavailable("injected get failure".to_string()).into());
        }
        parse_resource_version(&opts.resource_version)?;

        let inner = self.inner.read();
        match inner.objects.get(key) {
            Some(obj) => Ok(Some(obj.clone())),
            None if opts.ignore_not_found => Ok(None),
            None => Err(StorageError::NotFound { key: key.to_string() }.into()),
        }
    }

    async fn get_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList> {
        if take_injected_failure(&self.fail_lists) {
            return Err(StorageError::Unavailable("injected list failure".to_string()).into());
        }
        let requested = parse_resource_version(&opts.resource_version)?;

        let inner = self.inner.read();
        if requested != 0 && requested < inner.compacted {
            return Err(StorageError::TooOldResourceVersion {
                requested,
                compacted: inner.compacted,
            }
            .into());
        }

        let lower = match &opts.predicate.continue_key {
            Some(continue_key) => Bound::Excluded(continue_key.clone()),
            None => Bound::Included(key.to_string()),
        };
        let limit = opts.predicate.limit;
        let mut items = Vec::new();
        let mut last_key: Option<&String> = None;
        let mut continue_key = None;
        for (k, obj) in inner.objects.range((lower, Bound::Unbounded)) {
            if !key_in_scope(k, key, opts.recursive) || !opts.predicate.matches(obj) {
                continue;
            }
            if limit > 0 && items.len() == limit {
                continue_key = last_key.cloned();
                break;
            }
            items.push(obj.clone());
            last_key = Some(k);
        }

        Ok(ObjectList {
            items,
            resource_version: inner.resource_version,
            continue_key,
        })
    }

    async fn watch(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchStream> {
        if take_injected_failure(&self.fail_watches) {
            return Err(StorageError::Unavailable("injected watch failure".to_string()).into());
        }
        let requested = parse_resource_version(&opts.resource_version)?;

        // Replay and registration happen under the read lock so no commit falls in between.
        let inner = self.inner.read();
        let start = if requested == 0 {
            inner.resource_version
        } else {
            requested
        };
        if start < inner.compacted {
            return Err(StorageError::TooOldResourceVersion {
                requested: start,
                compacted: inner.compacted,
            }
            .into());
        }

        let backlog: Vec<WatchEvent> = inner
            .history
            .iter()
            .filter(|h| h.object.resource_version() > start)
            .filter(|h| key_in_scope(&h.key, key, opts.recursive) && opts.predicate.matches(&h.object))
            .map(|h| WatchEvent::from_parts(h.event_type, h.object.clone()))
            .collect();

        let (tx, rx) = mpsc::channel(self.watch_channel_size + backlog.len());
        for event in backlog {
            // capacity covers the whole backlog
            let _ = tx.try_send(event);
        }

        let watcher_id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(
            watcher_id,
            MemWatcher {
                key: key.to_string(),
                recursive: opts.recursive,
                predicate: opts.predicate.clone(),
                allow_bookmarks: opts.allow_watch_bookmarks(),
                sender: tx,
            },
        );
        drop(inner);

        debug!(watcher_id, key, start, "mem store watch registered");
        let watchers = self.watchers.clone();
        Ok(WatchStream::with_stop_hook(rx, move || {
            watchers.remove(&watcher_id);
        }))
    }

    async fn current_resource_version(&self) -> Result<u64> {
        Ok(self.inner.read().resource_version)
    }
}
