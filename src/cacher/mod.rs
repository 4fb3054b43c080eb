//! Watch cache and the machinery that keeps it current and fans it out.
//!
//! [`Cacher`] is the entry point; everything else is internal.
mod bookmark_timer;
mod cache_watcher;
#[allow(clippy::module_inception)]
mod cacher;
mod incoming;
mod ready;
mod reflector;
mod resource_version_policy;
mod time_budget;
mod time_bucket_watchers;
mod watch_cache;
mod watch_cache_interval;
mod watcher_registry;

pub use cacher::*;
pub use ready::*;
pub use reflector::ReflectorState;
