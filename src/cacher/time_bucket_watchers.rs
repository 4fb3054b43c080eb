use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::cache_watcher::CacheWatcher;

/// Bookmark-due index: watchers bucketed by the whole second (since the index
/// was created) at which their next bookmark is due.
///
/// Not synchronized; the cacher only touches it under its state lock.
pub(crate) struct TimeBucketWatchers {
    buckets: BTreeMap<u64, HashMap<u64, Arc<CacheWatcher>>>,
    /// watcher id -> bucket
    index: HashMap<u64, u64>,
    base: Instant,
    start_bucket: u64,
    frequency: Duration,
}

impl TimeBucketWatchers {
    pub(crate) fn new(frequency: Duration) -> Self {
        Self {
            buckets: BTreeMap::new(),
            index: HashMap::new(),
            base: Instant::now(),
            start_bucket: 0,
            frequency,
        }
    }

    fn bucket_of(
        &self,
        at: Instant,
    ) -> u64 {
        at.saturating_duration_since(self.base).as_secs()
    }

    /// Schedules `watcher` for its next bookmark. Returns false if it wants none.
    pub(crate) fn add_watcher_thread_unsafe(
        &mut self,
        watcher: Arc<CacheWatcher>,
        now: Instant,
    ) -> bool {
        let Some(next) = watcher.next_bookmark_time(now, self.frequency) else {
            return false;
        };
        // buckets before start_bucket were already popped
        let bucket = self.bucket_of(next).max(self.start_bucket);

        self.remove(watcher.id());
        self.index.insert(watcher.id(), bucket);
        self.buckets.entry(bucket).or_default().insert(watcher.id(), watcher);
        true
    }

    /// Removes and returns every watcher whose bucket is due at `now`.
    pub(crate) fn pop_expired_watchers_thread_unsafe(
        &mut self,
        now: Instant,
    ) -> Vec<Arc<CacheWatcher>> {
        let current = self.bucket_of(now);
        let mut expired = Vec::new();
        while let Some(entry) = self.buckets.first_entry() {
            if *entry.key() > current {
                break;
            }
            for (id, watcher) in entry.remove() {
                self.index.remove(&id);
                expired.push(watcher);
            }
        }
        self.start_bucket = self.start_bucket.max(current + 1);
        expired
    }

    pub(crate) fn remove(
        &mut self,
        id: u64,
    ) -> bool {
        let Some(bucket) = self.index.remove(&id) else {
            return false;
        };
        if let Some(watchers) = self.buckets.get_mut(&bucket) {
            watchers.remove(&id);
            if watchers.is_empty() {
                self.buckets.remove(&bucket);
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
