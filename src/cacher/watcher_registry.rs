use std::collections::HashMap;
use std::sync::Arc;

use super::cache_watcher::CacheWatcher;
use crate::constants::FIELD_METADATA_NAME;
use crate::constants::FIELD_METADATA_NAMESPACE;
use crate::SelectionPredicate;

/// Namespace/name a watcher is restricted to; empty parts match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub(crate) struct NamespacedName {
    pub(crate) namespace: String,
    pub(crate) name: String,
}

impl NamespacedName {
    pub(crate) fn new(
        namespace: &str,
        name: &str,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn from_predicate(predicate: &SelectionPredicate) -> Self {
        Self::new(
            predicate.field.requires_exact_match(FIELD_METADATA_NAMESPACE).unwrap_or_default(),
            predicate.field.requires_exact_match(FIELD_METADATA_NAME).unwrap_or_default(),
        )
    }

    /// Scopes whose watchers may be interested in an object at `namespace`/`name`.
    fn candidates(
        namespace: Option<&str>,
        name: &str,
    ) -> Vec<NamespacedName> {
        let mut scopes = Vec::with_capacity(4);
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            scopes.push(Self::new(ns, name));
            scopes.push(Self::new(ns, ""));
        }
        if !name.is_empty() {
            scopes.push(Self::new("", name));
        }
        scopes.push(Self::default());
        scopes.dedup();
        scopes
    }
}

/// Watchers grouped by scope so an event only visits watchers that can match it.
#[derive(Debug, Default)]
pub(crate) struct IndexedWatchers {
    all: HashMap<NamespacedName, HashMap<u64, Arc<CacheWatcher>>>,
}

impl IndexedWatchers {
    pub(crate) fn add(
        &mut self,
        watcher: Arc<CacheWatcher>,
    ) {
        self.all
            .entry(watcher.scope().clone())
            .or_default()
            .insert(watcher.id(), watcher);
    }

    pub(crate) fn delete(
        &mut self,
        id: u64,
        scope: &NamespacedName,
    ) -> Option<Arc<CacheWatcher>> {
        let watchers = self.all.get_mut(scope)?;
        let removed = watchers.remove(&id);
        if watchers.is_empty() {
            self.all.remove(scope);
        }
        removed
    }

    pub(crate) fn contains(
        &self,
        id: u64,
        scope: &NamespacedName,
    ) -> bool {
        self.all.get(scope).is_some_and(|watchers| watchers.contains_key(&id))
    }

    pub(crate) fn candidates(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Vec<Arc<CacheWatcher>> {
        NamespacedName::candidates(namespace, name)
            .iter()
            .filter_map(|scope| self.all.get(scope))
            .flat_map(|watchers| watchers.values().cloned())
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<CacheWatcher>> {
        self.all.values().flat_map(|watchers| watchers.values())
    }

    pub(crate) fn drain_all(&mut self) -> Vec<Arc<CacheWatcher>> {
        self.all
            .drain()
            .flat_map(|(_, watchers)| watchers.into_values())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.all.values().map(HashMap::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn scope_count(&self) -> usize {
        self.all.len()
    }
}
