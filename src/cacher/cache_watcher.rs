//! Per-watch delivery state
//!
//! The dispatcher pushes events into a watcher's bounded input; the watcher's
//! own task replays its initial interval, then forwards live input to the
//! client's output channel, converting and filtering on the way.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::watch_cache_interval::WatchCacheInterval;
use super::watcher_registry::NamespacedName;
use crate::constants::BOOKMARK_DEADLINE_SLACK_SECS;
use crate::has_path_prefix;
use crate::EventType;
use crate::Fields;
use crate::Labels;
use crate::Object;
use crate::Result;
use crate::SelectionPredicate;
use crate::WatchCacheEvent;
use crate::WatchEvent;

pub(crate) type ExitHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatcherPhase {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct WatcherState {
    phase: WatcherPhase,
    /// A bookmark at or above `bookmark_after_resource_version` was queued
    bookmark_after_received: bool,
    /// The initial-events-end bookmark reached the client
    bookmark_after_sent: bool,
    /// Version of the last bookmark forwarded to the client
    last_bookmark: u64,
}

pub(crate) struct WatcherParams {
    pub(crate) key: String,
    pub(crate) recursive: bool,
    pub(crate) predicate: SelectionPredicate,
    pub(crate) bookmark_after_resource_version: Option<u64>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) history_generation: u64,
    pub(crate) input_capacity: usize,
}

pub(crate) struct CacheWatcher {
    id: u64,
    input: mpsc::Sender<Arc<WatchCacheEvent>>,
    key: String,
    recursive: bool,
    predicate: SelectionPredicate,
    scope: NamespacedName,
    allow_watch_bookmarks: bool,
    bookmark_after_resource_version: Option<u64>,
    deadline: Option<Instant>,
    history_generation: u64,
    state: Mutex<WatcherState>,
    done: CancellationToken,
}

impl std::fmt::Debug for CacheWatcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CacheWatcher")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("scope", &self.scope)
            .field("phase", &self.phase())
            .finish()
    }
}

impl CacheWatcher {
    pub(crate) fn new(
        id: u64,
        params: WatcherParams,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<WatchCacheEvent>>) {
        let (input, input_rx) = mpsc::channel(params.input_capacity.max(1));
        let allow_watch_bookmarks = params.predicate.allow_watch_bookmarks;
        let watcher = Self {
            id,
            input,
            scope: NamespacedName::from_predicate(&params.predicate),
            key: params.key,
            recursive: params.recursive,
            predicate: params.predicate,
            allow_watch_bookmarks,
            bookmark_after_resource_version: params.bookmark_after_resource_version,
            deadline: params.deadline,
            history_generation: params.history_generation,
            state: Mutex::new(WatcherState {
                phase: WatcherPhase::Created,
                bookmark_after_received: false,
                bookmark_after_sent: false,
                last_bookmark: 0,
            }),
            done: CancellationToken::new(),
        };
        (Arc::new(watcher), input_rx)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn scope(&self) -> &NamespacedName {
        &self.scope
    }

    pub(crate) fn history_generation(&self) -> u64 {
        self.history_generation
    }

    pub(crate) fn allow_watch_bookmarks(&self) -> bool {
        self.allow_watch_bookmarks
    }

    pub(crate) fn phase(&self) -> WatcherPhase {
        self.state.lock().phase
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Requests termination. Idempotent.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, WatcherPhase::Stopping | WatcherPhase::Stopped) {
            return;
        }
        state.phase = WatcherPhase::Stopping;
        drop(state);
        self.done.cancel();
    }

    /// Tries to queue `event` without waiting.
    ///
    /// Returns false only when the input is full, or for a bookmark that is
    /// older than the bookmark this watcher waits for. A stopped watcher
    /// swallows events.
    pub(crate) fn nonblocking_add(
        &self,
        event: &Arc<WatchCacheEvent>,
    ) -> bool {
        if event.event_type == EventType::Bookmark {
            if let Some(after) = self.bookmark_after_resource_version {
                if event.resource_version < after {
                    return false;
                }
            }
        }
        if self.done.is_cancelled() {
            return true;
        }
        match self.input.try_send(event.clone()) {
            Ok(()) => {
                self.mark_bookmark_after_received(event);
                true
            }
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => true,
        }
    }

    /// Queues `event`, waiting for room until `deadline`.
    pub(crate) async fn add(
        &self,
        event: &Arc<WatchCacheEvent>,
        deadline: Instant,
    ) -> bool {
        if self.nonblocking_add(event) {
            return true;
        }
        tokio::select! {
            biased;
            _ = self.done.cancelled() => true,
            sent = tokio::time::timeout_at(deadline, self.input.send(event.clone())) => sent.is_ok(),
        }
    }

    fn mark_bookmark_after_received(
        &self,
        event: &WatchCacheEvent,
    ) {
        if event.event_type != EventType::Bookmark {
            return;
        }
        if let Some(after) = self.bookmark_after_resource_version {
            if event.resource_version >= after {
                self.state.lock().bookmark_after_received = true;
            }
        }
    }

    fn initial_events_end_outstanding(&self) -> bool {
        self.bookmark_after_resource_version.is_some() && !self.state.lock().bookmark_after_sent
    }

    /// When this watcher should next be offered a bookmark.
    pub(crate) fn next_bookmark_time(
        &self,
        now: Instant,
        frequency: Duration,
    ) -> Option<Instant> {
        if !self.allow_watch_bookmarks {
            return None;
        }
        if self.bookmark_after_resource_version.is_some() && !self.state.lock().bookmark_after_received {
            return Some(now);
        }
        let mut next = now + frequency;
        if let Some(deadline) = self.deadline {
            let pre_timeout = deadline.checked_sub(Duration::from_secs(BOOKMARK_DEADLINE_SLACK_SECS))?;
            if pre_timeout < next {
                next = pre_timeout;
            }
            if next < now {
                return None;
            }
        }
        Some(next)
    }

    fn filter(
        &self,
        key: &str,
        labels: &Labels,
        fields: &Fields,
    ) -> bool {
        let key_matches = if self.recursive {
            has_path_prefix(key, &self.key)
        } else {
            key == self.key
        };
        key_matches && self.predicate.matches_object_attributes(labels, fields)
    }

    pub(crate) fn convert_to_watch_event(
        &self,
        event: &WatchCacheEvent,
    ) -> Option<WatchEvent> {
        if event.event_type == EventType::Bookmark {
            if !self.allow_watch_bookmarks {
                return None;
            }
            if self.initial_events_end_outstanding() {
                return Some(WatchEvent::Bookmark(Object::initial_events_end_bookmark(
                    event.resource_version,
                )));
            }
            return Some(WatchEvent::Bookmark(Object::bookmark(event.resource_version)));
        }

        let cur_passes =
            event.event_type != EventType::Deleted && self.filter(&event.key, &event.obj_labels, &event.obj_fields);
        let prev_passes = event.prev_object.is_some()
            && self.filter(&event.key, &event.prev_obj_labels, &event.prev_obj_fields);

        match (cur_passes, prev_passes, &event.prev_object) {
            (true, false, _) => Some(WatchEvent::Added((*event.object).clone())),
            (true, true, _) => Some(WatchEvent::Modified((*event.object).clone())),
            (false, true, Some(prev)) => {
                let mut last = (**prev).clone();
                last.meta.resource_version = event.resource_version;
                Some(WatchEvent::Deleted(last))
            }
            _ => None,
        }
    }

    /// Converts and forwards one event; false once the watcher or its client is gone.
    async fn send_event(
        &self,
        event: &WatchCacheEvent,
        result: &mpsc::Sender<WatchEvent>,
    ) -> bool {
        let Some(watch_event) = self.convert_to_watch_event(event) else {
            return true;
        };
        self.send_watch_event(watch_event, result).await
    }

    async fn send_watch_event(
        &self,
        watch_event: WatchEvent,
        result: &mpsc::Sender<WatchEvent>,
    ) -> bool {
        let bookmark = match &watch_event {
            WatchEvent::Bookmark(obj) => Some((obj.resource_version(), obj.is_initial_events_end())),
            _ => None,
        };
        tokio::select! {
            biased;
            _ = self.done.cancelled() => false,
            sent = result.send(watch_event) => {
                if sent.is_err() {
                    return false;
                }
                if let Some((rv, initial_events_end)) = bookmark {
                    let mut state = self.state.lock();
                    state.last_bookmark = state.last_bookmark.max(rv);
                    if initial_events_end {
                        state.bookmark_after_sent = true;
                        state.bookmark_after_received = true;
                    }
                }
                true
            }
        }
    }

    /// Body of the watcher's task: replay `interval`, then forward live input
    /// newer than everything delivered so far.
    pub(crate) async fn process_interval(
        self: Arc<Self>,
        mut interval: WatchCacheInterval,
        mut input: mpsc::Receiver<Arc<WatchCacheEvent>>,
        result: mpsc::Sender<WatchEvent>,
        start_resource_version: u64,
        on_exit: ExitHook,
    ) {
        {
            let mut state = self.state.lock();
            if state.phase == WatcherPhase::Created {
                state.phase = WatcherPhase::Running;
            }
        }

        if let Err(e) = self
            .run(&mut interval, &mut input, &result, start_resource_version)
            .await
        {
            warn!(watcher = self.id, "watcher terminated: {}", e);
        }

        self.state.lock().phase = WatcherPhase::Stopped;
        self.done.cancel();
        drop(result);
        on_exit();
        debug!(watcher = self.id, "watcher exited");
    }

    async fn run(
        &self,
        interval: &mut WatchCacheInterval,
        input: &mut mpsc::Receiver<Arc<WatchCacheEvent>>,
        result: &mpsc::Sender<WatchEvent>,
        start_resource_version: u64,
    ) -> Result<()> {
        let mut resource_version = start_resource_version;

        while let Some(event) = interval.next()? {
            if !self.send_event(&event, result).await {
                return Ok(());
            }
            resource_version = resource_version.max(event.resource_version);
        }
        resource_version = resource_version.max(interval.resource_version());

        if let Some(after) = self.bookmark_after_resource_version {
            if after <= resource_version && self.initial_events_end_outstanding() {
                let bookmark = WatchEvent::Bookmark(Object::initial_events_end_bookmark(resource_version));
                if !self.send_watch_event(bookmark, result).await {
                    return Ok(());
                }
            }
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.done.cancelled() => return Ok(()),
                _ = sleep_until_deadline(self.deadline) => return Ok(()),
                event = input.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            let forward = if event.event_type == EventType::Bookmark {
                let last_bookmark = self.state.lock().last_bookmark;
                event.resource_version >= resource_version
                    && (event.resource_version > last_bookmark || self.initial_events_end_outstanding())
            } else {
                event.resource_version > resource_version
            };
            if !forward {
                continue;
            }
            if !self.send_event(&event, result).await {
                return Ok(());
            }
            resource_version = resource_version.max(event.resource_version);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
