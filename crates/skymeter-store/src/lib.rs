//! Concurrent in-memory key-value caches for the Skymeter metering pipeline.
#![forbid(unsafe_code)]
//!
//! `skymeter-store` provides [`Store`], a named, cloneable, thread-safe
//! key→value cache. The pipeline keeps two instances: a per-cluster instance
//! cache and a per-region VM-capability cache. There is no eviction and no
//! iteration-order guarantee; every operation is a single atomic step and no
//! cross-key transaction exists.
//!
//! # Example
//!
//! ```rust
//! use skymeter_store::Store;
//!
//! let store: Store<String, u32> = Store::new("counters");
//! store.put("a".to_string(), 1);
//! assert_eq!(store.get(&"a".to_string()), Some(1));
//! assert_eq!(store.delete(&"a".to_string()), Some(1));
//! assert!(store.is_empty());
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Thread-safe in-memory key→value store.
///
/// Cloning a `Store` produces another handle to the same underlying map, so
/// it can be shared freely between the intake task and worker tasks. Values
/// are returned by clone; callers that mutate a value must write it back with
/// [`Store::put`], and rely on external per-key serialization (the work
/// queue) to avoid racing read-modify-write sequences.
#[derive(Debug)]
pub struct Store<K, V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a new empty store. The name is used only for logging.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns a clone of the value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Inserts or replaces the value for `key`.
    pub fn put(&self, key: K, value: V) {
        let mut entries = self.entries.write();
        entries.insert(key, value);
        debug!(store = self.name, len = entries.len(), "stored entry");
    }

    /// Removes the entry for `key`, returning the removed value.
    ///
    /// Removing an absent key is a no-op and returns `None`.
    pub fn delete(&self, key: &K) -> Option<V> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            debug!(store = self.name, "deleted entry");
        }
        removed
    }

    /// Returns `true` if `key` has an entry.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns a snapshot of all keys, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }
}
