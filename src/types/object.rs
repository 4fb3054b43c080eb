use std::collections::BTreeMap;

use bytes::Bytes;

use crate::constants::FIELD_METADATA_NAME;
use crate::constants::FIELD_METADATA_NAMESPACE;
use crate::constants::INITIAL_EVENTS_END_ANNOTATION;

pub type Labels = BTreeMap<String, String>;
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub name: String,
    /// `None` for cluster-scoped objects
    pub namespace: Option<String>,
    pub resource_version: u64,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
}

/// A stored object. The payload in `data` is opaque to the cache; only
/// metadata, labels and selectable fields are ever inspected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Object {
    pub meta: ObjectMeta,
    /// Selectable fields besides `metadata.name` / `metadata.namespace`
    pub fields: Fields,
    pub data: Bytes,
}

impl Object {
    pub fn new(
        namespace: Option<&str>,
        name: &str,
    ) -> Self {
        Self {
            meta: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Payload-free object carrying only a resource version.
    pub fn bookmark(resource_version: u64) -> Self {
        Self {
            meta: ObjectMeta {
                resource_version,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Bookmark that marks the end of an initial-events replay.
    pub fn initial_events_end_bookmark(resource_version: u64) -> Self {
        let mut obj = Self::bookmark(resource_version);
        obj.meta
            .annotations
            .insert(INITIAL_EVENTS_END_ANNOTATION.to_string(), "true".to_string());
        obj
    }

    pub fn is_initial_events_end(&self) -> bool {
        self.meta
            .annotations
            .get(INITIAL_EVENTS_END_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    pub fn with_label(
        mut self,
        key: &str,
        value: &str,
    ) -> Self {
        self.meta.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_field(
        mut self,
        key: &str,
        value: &str,
    ) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_data(
        mut self,
        data: impl Into<Bytes>,
    ) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_resource_version(
        mut self,
        resource_version: u64,
    ) -> Self {
        self.meta.resource_version = resource_version;
        self
    }

    pub fn resource_version(&self) -> u64 {
        self.meta.resource_version
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn labels(&self) -> &Labels {
        &self.meta.labels
    }

    /// The full selectable field set, including the metadata fields.
    pub fn field_set(&self) -> Fields {
        let mut fields = self.fields.clone();
        fields.insert(FIELD_METADATA_NAME.to_string(), self.meta.name.clone());
        if let Some(ns) = &self.meta.namespace {
            fields.insert(FIELD_METADATA_NAMESPACE.to_string(), ns.clone());
        }
        fields
    }
}

/// Storage key of `obj` below `prefix`: `prefix/namespace/name` or `prefix/name`.
pub fn object_key(
    prefix: &str,
    obj: &Object,
) -> String {
    let prefix = prefix.trim_end_matches('/');
    match obj.namespace() {
        Some(ns) => format!("{}/{}/{}", prefix, ns, obj.name()),
        None => format!("{}/{}", prefix, obj.name()),
    }
}

/// True if `key` is `prefix` itself or lives below it.
pub fn has_path_prefix(
    key: &str,
    prefix: &str,
) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Result of a list request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectList {
    pub items: Vec<Object>,
    pub resource_version: u64,
    /// Set when the list was truncated by a limit; pass it back to continue
    pub continue_key: Option<String>,
}
