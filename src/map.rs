//! A typed concurrent map used pervasively by the engine and service layers.
//!
//! The discovery engine races concurrent `Discovery`/`Register` callers
//! against the watcher loop, so every shared map needs atomic
//! `load_or_store` semantics. Built on `dashmap`'s sharded concurrent map
//! rather than a hand-rolled `Mutex<HashMap<_>>`.

use dashmap::DashMap;
use std::hash::Hash;

/// A typed K -> V mapping safe under concurrent readers and writers.
pub struct ConcurrentMap<K, V> {
    inner: DashMap<K, V>,
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        ConcurrentMap { inner: DashMap::new() }
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    pub fn load(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| v.clone())
    }

    pub fn exist(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Atomically returns the existing value for `key`, or stores `value`
    /// and returns it. The boolean is `true` when an existing entry was
    /// found (the passed-in `value` was discarded).
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        match self.inner.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), true),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(value.clone());
                (value, false)
            }
        }
    }

    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    pub fn delete(&self, key: &K) {
        self.inner.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates all entries; `f` returning `false` stops iteration early.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for entry in self.inner.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_store_is_atomic_to_a_single_winner() {
        let m: ConcurrentMap<&'static str, i32> = ConcurrentMap::new();
        let (v1, existed1) = m.load_or_store("a", 1);
        let (v2, existed2) = m.load_or_store("a", 2);
        assert_eq!(v1, 1);
        assert!(!existed1);
        assert_eq!(v2, 1);
        assert!(existed2);
    }

    #[test]
    fn delete_and_range() {
        let m: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        m.store(1, 10);
        m.store(2, 20);
        m.store(3, 30);
        m.delete(&2);
        let mut seen = Vec::new();
        m.range(|k, v| {
            seen.push((*k, *v));
            true
        });
        seen.sort();
        assert_eq!(seen, vec![(1, 10), (3, 30)]);
    }

    #[test]
    fn range_can_stop_early() {
        let m: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        for i in 0..10 {
            m.store(i, i);
        }
        let mut count = 0;
        m.range(|_, _| {
            count += 1;
            count < 3
        });
        assert_eq!(count, 3);
    }
}
