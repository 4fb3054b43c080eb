//! Where a watch starts, and which version ends its initial events.
//!
//! Both are computed from the request before the watch cache lock is taken,
//! as a [`VersionSource`], and resolved under the lock so that "the cache's
//! current version" means the version the interval is built at.

use crate::ListOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VersionSource {
    Exact(u64),
    /// The watch cache's version at registration
    WatchCache,
    /// The backing store's current version
    Storage,
    None,
}

impl VersionSource {
    pub(crate) fn needs_storage(&self) -> bool {
        matches!(self, VersionSource::Storage)
    }

    pub(crate) fn resolve(
        self,
        cache_resource_version: u64,
        storage_resource_version: u64,
    ) -> Option<u64> {
        match self {
            VersionSource::Exact(rv) => Some(rv),
            VersionSource::WatchCache => Some(cache_resource_version),
            VersionSource::Storage => Some(storage_resource_version),
            VersionSource::None => None,
        }
    }
}

pub(crate) fn start_watch_resource_version(
    opts: &ListOptions,
    parsed: u64,
) -> VersionSource {
    match opts.send_initial_events {
        None | Some(true) => VersionSource::Exact(parsed),
        Some(false) => common_resource_version(opts, parsed),
    }
}

pub(crate) fn bookmark_after_resource_version(
    opts: &ListOptions,
    parsed: u64,
) -> VersionSource {
    if opts.send_initial_events == Some(true) && opts.allow_watch_bookmarks() {
        return common_resource_version(opts, parsed);
    }
    VersionSource::None
}

fn common_resource_version(
    opts: &ListOptions,
    parsed: u64,
) -> VersionSource {
    if opts.resource_version.is_empty() {
        return VersionSource::Storage;
    }
    if parsed == 0 {
        return VersionSource::WatchCache;
    }
    VersionSource::Exact(parsed)
}
