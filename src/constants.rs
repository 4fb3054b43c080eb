// -
// Watch cache intervals

/// Number of events an interval copies out of the ring buffer per refill
pub(crate) const INTERVAL_BUFFER_SIZE: usize = 100;

// -
// Bookmarks

/// Annotation set on the bookmark that ends an initial-events replay
pub const INITIAL_EVENTS_END_ANNOTATION: &str = "k8s.io/initial-events-end";

/// Bookmarks are never scheduled closer than this to a watch deadline
pub(crate) const BOOKMARK_DEADLINE_SLACK_SECS: u64 = 2;

// -
// Field selectors

pub const FIELD_METADATA_NAME: &str = "metadata.name";
pub const FIELD_METADATA_NAMESPACE: &str = "metadata.namespace";

// -
// Config

pub(crate) const CONFIG_ENV_PREFIX: &str = "CACHER";
