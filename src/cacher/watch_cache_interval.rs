use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use super::watch_cache::WatchCacheInner;
use crate::constants::INTERVAL_BUFFER_SIZE;
use crate::CacheError;
use crate::Result;
use crate::WatchCacheEvent;

enum IntervalSource {
    /// Events `[start_index, end_index)` of the ring buffer, copied out lazily.
    Buffer {
        cache: Arc<RwLock<WatchCacheInner>>,
        start_index: u64,
        end_index: u64,
    },
    /// Fully materialized snapshot of the store.
    Store,
}

/// Sequence of events a new watcher replays before switching to live input.
///
/// Buffer intervals hold absolute ring-buffer indices. Every refill checks the
/// next index against the buffer's current start index; once that slot has
/// been evicted the interval fails with [`CacheError::IntervalInvalidated`].
pub(crate) struct WatchCacheInterval {
    source: IntervalSource,
    buffer: VecDeque<Arc<WatchCacheEvent>>,
    /// Cache resource version when the interval was taken
    resource_version: u64,
}

impl std::fmt::Debug for WatchCacheInterval {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchCacheInterval")
            .field("buffered", &self.buffer.len())
            .field("resource_version", &self.resource_version)
            .finish_non_exhaustive()
    }
}

impl WatchCacheInterval {
    pub(crate) fn from_buffer(
        cache: Arc<RwLock<WatchCacheInner>>,
        start_index: u64,
        end_index: u64,
        resource_version: u64,
    ) -> Self {
        Self {
            source: IntervalSource::Buffer {
                cache,
                start_index,
                end_index,
            },
            buffer: VecDeque::new(),
            resource_version,
        }
    }

    pub(crate) fn from_store(
        events: Vec<Arc<WatchCacheEvent>>,
        resource_version: u64,
    ) -> Self {
        Self {
            source: IntervalSource::Store,
            buffer: events.into(),
            resource_version,
        }
    }

    pub(crate) fn resource_version(&self) -> u64 {
        self.resource_version
    }

    pub(crate) fn is_store_snapshot(&self) -> bool {
        matches!(self.source, IntervalSource::Store)
    }

    /// Next event, `Ok(None)` once the interval is exhausted.
    pub(crate) fn next(&mut self) -> Result<Option<Arc<WatchCacheEvent>>> {
        if self.buffer.is_empty() {
            self.fill_buffer()?;
        }
        Ok(self.buffer.pop_front())
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let IntervalSource::Buffer {
            cache,
            start_index,
            end_index,
        } = &mut self.source
        else {
            return Ok(());
        };
        if *start_index >= *end_index {
            return Ok(());
        }

        let inner = cache.read();
        if *start_index < inner.start_index() {
            return Err(CacheError::IntervalInvalidated {
                start_index: *start_index,
            }
            .into());
        }

        let batch_end = (*start_index + INTERVAL_BUFFER_SIZE as u64).min(*end_index);
        for index in *start_index..batch_end {
            if let Some(event) = inner.event_at(index) {
                self.buffer.push_back(event);
            }
        }
        *start_index = batch_end;
        Ok(())
    }
}
