use std::sync::Arc;

use tokio::time::Instant;

use super::Fields;
use super::Labels;
use super::Object;

/// Kind of a recorded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    /// Carries only a resource version
    Bookmark,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Modified => "modified",
            EventType::Deleted => "deleted",
            EventType::Bookmark => "bookmark",
        }
    }
}

/// One mutation as retained by the ring buffer and fanned out to watchers.
///
/// `prev_*` describe the object's state before the mutation and are used to
/// turn a modification into Added/Deleted for watchers whose predicate the
/// object entered or left.
#[derive(Debug, Clone)]
pub struct WatchCacheEvent {
    pub event_type: EventType,
    pub object: Arc<Object>,
    pub obj_labels: Labels,
    pub obj_fields: Fields,
    pub prev_object: Option<Arc<Object>>,
    pub prev_obj_labels: Labels,
    pub prev_obj_fields: Fields,
    pub key: String,
    pub resource_version: u64,
    pub record_time: Instant,
}

impl WatchCacheEvent {
    pub fn new(
        event_type: EventType,
        key: String,
        object: Arc<Object>,
        prev_object: Option<Arc<Object>>,
        resource_version: u64,
    ) -> Self {
        let obj_labels = object.labels().clone();
        let obj_fields = object.field_set();
        let (prev_obj_labels, prev_obj_fields) = match &prev_object {
            Some(prev) => (prev.labels().clone(), prev.field_set()),
            None => (Labels::new(), Fields::new()),
        };
        Self {
            event_type,
            object,
            obj_labels,
            obj_fields,
            prev_object,
            prev_obj_labels,
            prev_obj_fields,
            key,
            resource_version,
            record_time: Instant::now(),
        }
    }

    pub fn bookmark(resource_version: u64) -> Self {
        Self {
            event_type: EventType::Bookmark,
            object: Arc::new(Object::bookmark(resource_version)),
            obj_labels: Labels::new(),
            obj_fields: Fields::new(),
            prev_object: None,
            prev_obj_labels: Labels::new(),
            prev_obj_fields: Fields::new(),
            key: String::new(),
            resource_version,
            record_time: Instant::now(),
        }
    }

    /// Initial-state replay entry for a stored object.
    pub fn added_from_store(
        key: String,
        object: Arc<Object>,
        labels: Labels,
        fields: Fields,
    ) -> Self {
        let resource_version = object.resource_version();
        Self {
            event_type: EventType::Added,
            object,
            obj_labels: labels,
            obj_fields: fields,
            prev_object: None,
            prev_obj_labels: Labels::new(),
            prev_obj_fields: Fields::new(),
            key,
            resource_version,
            record_time: Instant::now(),
        }
    }
}

/// Error payload delivered in-band on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

/// Event as seen by a watch client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    Bookmark(Object),
    Error(Status),
}

impl WatchEvent {
    pub fn from_parts(
        event_type: EventType,
        object: Object,
    ) -> Self {
        match event_type {
            EventType::Added => WatchEvent::Added(object),
            EventType::Modified => WatchEvent::Modified(object),
            EventType::Deleted => WatchEvent::Deleted(object),
            EventType::Bookmark => WatchEvent::Bookmark(object),
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        match self {
            WatchEvent::Added(_) => Some(EventType::Added),
            WatchEvent::Modified(_) => Some(EventType::Modified),
            WatchEvent::Deleted(_) => Some(EventType::Deleted),
            WatchEvent::Bookmark(_) => Some(EventType::Bookmark),
            WatchEvent::Error(_) => None,
        }
    }

    pub fn object(&self) -> Option<&Object> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) | WatchEvent::Bookmark(o) => {
                Some(o)
            }
            WatchEvent::Error(_) => None,
        }
    }

    pub fn resource_version(&self) -> Option<u64> {
        self.object().map(Object::resource_version)
    }
}
