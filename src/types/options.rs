use std::time::Duration;

use super::SelectionPredicate;

/// How an explicit resource version on a list is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceVersionMatch {
    /// Any state at or after the version
    NotOlderThan,
    /// Exactly the state at the version
    Exact,
}

/// Options for a single-object read.
///
/// `resource_version` follows the usual string convention: `""` requests the
/// most recent state, `"0"` accepts any cached state, `"<n>"` names a version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub resource_version: String,
    pub ignore_not_found: bool,
}

/// Options shared by list and watch requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub resource_version: String,
    pub resource_version_match: Option<ResourceVersionMatch>,
    /// Treat the key as a prefix
    pub recursive: bool,
    pub predicate: SelectionPredicate,
    /// Watch only: replay the current state first and, with bookmarks
    /// allowed, mark the end of the replay with an annotated bookmark
    pub send_initial_events: Option<bool>,
    /// Watch only: close the watch after this long
    pub timeout: Option<Duration>,
}

impl ListOptions {
    pub fn recursive(resource_version: &str) -> Self {
        Self {
            resource_version: resource_version.to_string(),
            recursive: true,
            ..Default::default()
        }
    }

    pub fn allow_watch_bookmarks(&self) -> bool {
        self.predicate.allow_watch_bookmarks
    }
}
