//! Process-local listener registry.
//!
//! Maps a key (registration key or group) to the set of listeners currently
//! registered under it in this process. Each key's set is an immutable
//! `Arc<Vec<_>>` swapped under the map's per-shard lock, so concurrent
//! register and unregister calls never lose an update and readers get a
//! consistent snapshot without blocking writers for long.
//!
//! Adding reports whether the listener was the first for its key; removing
//! reports whether it was the last. Callers use these transitions to bind and
//! unbind broker subscriptions.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::listener::{same_listener, EventListener};

type ListenerSet = Arc<Vec<Arc<dyn EventListener>>>;

pub(crate) struct LocalListenerRegistry<K> {
    listeners: DashMap<K, ListenerSet>,
}

impl<K> LocalListenerRegistry<K>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    /// Add `listener` under `key`. Adding the same listener twice is a no-op.
    pub(crate) fn add_listener(
        self: &Arc<Self>,
        key: K,
        listener: Arc<dyn EventListener>,
    ) -> LocalRegistration<K> {
        let first = match self.listeners.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().iter().any(|l| same_listener(l, &listener)) {
                    let mut updated = Vec::with_capacity(entry.get().len() + 1);
                    updated.extend(entry.get().iter().cloned());
                    updated.push(Arc::clone(&listener));
                    entry.insert(Arc::new(updated));
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(vec![Arc::clone(&listener)]));
                true
            }
        };

        LocalRegistration {
            registry: Arc::clone(self),
            key,
            listener,
            first,
        }
    }

    /// Returns true when `listener` was the last one under `key`. Removing an
    /// absent listener returns false.
    fn remove_listener(&self, key: &K, listener: &Arc<dyn EventListener>) -> bool {
        match self.listeners.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let remaining: Vec<_> = entry
                    .get()
                    .iter()
                    .filter(|l| !same_listener(l, listener))
                    .cloned()
                    .collect();

                if remaining.len() == entry.get().len() {
                    false
                } else if remaining.is_empty() {
                    entry.remove();
                    true
                } else {
                    entry.insert(Arc::new(remaining));
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Snapshot of the listeners registered under `key`.
    pub(crate) fn listeners(&self, key: &K) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys with at least one listener.
    pub(crate) fn keys(&self) -> Vec<K> {
        self.listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// One listener's membership under one key.
pub(crate) struct LocalRegistration<K>
where
    K: Eq + Hash + Clone,
{
    registry: Arc<LocalListenerRegistry<K>>,
    key: K,
    listener: Arc<dyn EventListener>,
    first: bool,
}

impl<K> LocalRegistration<K>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn is_first_listener(&self) -> bool {
        self.first
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Remove the listener. Returns true when it was the last for its key.
    pub(crate) fn unregister(&self) -> bool {
        self.registry.remove_listener(&self.key, &self.listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingListener;

    fn registry() -> Arc<LocalListenerRegistry<&'static str>> {
        Arc::new(LocalListenerRegistry::new())
    }

    fn listener() -> Arc<dyn EventListener> {
        Arc::new(CountingListener::new())
    }

    #[test]
    fn test_first_and_last_transitions() {
        let registry = registry();
        let a = registry.add_listener("k", listener());
        let b = registry.add_listener("k", listener());

        assert!(a.is_first_listener());
        assert!(!b.is_first_listener());

        assert!(!a.unregister());
        assert!(b.unregister());
        assert!(registry.listeners(&"k").is_empty());
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn test_duplicate_listener_is_set_insertion() {
        let registry = registry();
        let shared = listener();
        let first = registry.add_listener("k", Arc::clone(&shared));
        let second = registry.add_listener("k", Arc::clone(&shared));

        assert_eq!(registry.listeners(&"k").len(), 1);
        assert!(first.unregister());
        assert!(!second.unregister());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = registry();
        let registration = registry.add_listener("k", listener());
        assert!(registration.unregister());
        assert!(!registration.unregister());
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = registry();
        let shared = listener();
        let on_a = registry.add_listener("a", Arc::clone(&shared));
        let on_b = registry.add_listener("b", Arc::clone(&shared));

        assert!(on_a.is_first_listener());
        assert!(on_b.is_first_listener());
        assert!(on_a.unregister());
        assert_eq!(registry.listeners(&"b").len(), 1);
    }

    #[test]
    fn test_re_registration_after_last_is_first_again() {
        let registry = registry();
        let registration = registry.add_listener("k", listener());
        registration.unregister();
        assert!(registry.add_listener("k", listener()).is_first_listener());
    }

    #[test]
    fn test_snapshot_is_stable_while_mutating() {
        let registry = registry();
        let _a = registry.add_listener("k", listener());
        let snapshot = registry.listeners(&"k");
        let _b = registry.add_listener("k", listener());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.listeners(&"k").len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_do_not_lose_updates() {
        let registry = registry();
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.add_listener("k", listener());
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.listeners(&"k").len(), 50);
    }
}
