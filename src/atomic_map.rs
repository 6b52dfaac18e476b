//! Copy-on-write concurrent map for the peer registry. Writers rebuild the map and
//!  swap in a fresh `Arc` under a mutex; readers clone the current `Arc` under that
//!  same lock (held for a pointer copy only) and then work on an immutable snapshot.
//!  A replaced map stays alive until its last reader drops it, so lookups never race
//!  reclamation. Insertions and removals are rare (first contact / explicit removal
//!  of a peer) while lookups happen per datagram, which is exactly the trade-off
//!  this structure makes.

use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub struct AtomicMap<K, V> {
    current: Mutex<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        AtomicMap {
            current: Mutex::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    /// A consistent point-in-time view, e.g. for iterating all peers in the tick loop.
    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        self.current.lock().unwrap().clone()
    }

    /// Returns the value for `key`, inserting the one produced by `create` if the key
    ///  is absent. `create` only runs when the insert actually happens.
    pub fn get_or_insert_with(&self, key: K, create: impl FnOnce() -> V) -> V {
        let mut current = self.current.lock().unwrap();
        if let Some(existing) = current.get(&key) {
            return existing.clone();
        }

        let value = create();
        let mut updated: FxHashMap<K, V> = current.as_ref().clone();
        updated.insert(key, value.clone());
        *current = Arc::new(updated);
        value
    }

    pub fn remove(&self, key: &K) {
        let mut current = self.current.lock().unwrap();
        if !current.contains_key(key) {
            return;
        }

        let mut updated: FxHashMap<K, V> = current.as_ref().clone();
        updated.remove(key);
        *current = Arc::new(updated);
    }
}
