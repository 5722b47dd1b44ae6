use super::{empty_balancer, LoadBalance, Node, NodeStore};
use crate::error::Result;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic-counter round robin. Selection is `nodes[(counter + 1) %
/// size]`; `remove` nudges the counter back by one so the next selection
/// lands on the same relative position rather than skipping an entry.
pub struct RoundRobin<K, V> {
    store: NodeStore<K, V>,
    counter: AtomicI64,
}

impl<K, V> RoundRobin<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        RoundRobin { store: NodeStore::new(), counter: AtomicI64::new(0) }
    }
}

impl<K, V> Default for RoundRobin<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LoadBalance<K, V> for RoundRobin<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn append(&self, nodes: Vec<Box<dyn Node<K, V> + Send + Sync>>) {
        self.store.append(nodes);
    }

    fn remove(&self, key: &K) -> bool {
        let removed = self.store.remove(key);
        if removed {
            self.counter.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn next(&self) -> Result<V> {
        let size = self.store.len() as i64;
        if size == 0 {
            return empty_balancer();
        }
        let next = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let idx = next.rem_euclid(size) as usize;
        Ok(self.store.get(idx).expect("index within bounds"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::tests::boxed;

    #[test]
    fn fairness_over_full_cycles() {
        let rr: RoundRobin<&'static str, &'static str> = RoundRobin::new();
        rr.append(boxed(&["a", "b", "c"]));

        let mut counts = std::collections::HashMap::new();
        for _ in 0..12 {
            let v = rr.next().unwrap();
            *counts.entry(v).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 4);
        assert_eq!(counts["b"], 4);
        assert_eq!(counts["c"], 4);
    }

    #[test]
    fn removal_keeps_selection_contiguous() {
        let rr: RoundRobin<&'static str, &'static str> = RoundRobin::new();
        rr.append(boxed(&["a", "b", "c"]));
        rr.remove(&"b");
        let picks: Vec<_> = (0..6).map(|_| rr.next().unwrap()).collect();
        assert_eq!(picks, vec!["a", "c", "a", "c", "a", "c"]);
    }

    #[test]
    fn empty_balancer_errors() {
        let rr: RoundRobin<&'static str, &'static str> = RoundRobin::new();
        assert!(rr.next().is_err());
    }

    #[test]
    fn append_dedups_by_key() {
        let rr: RoundRobin<&'static str, &'static str> = RoundRobin::new();
        rr.append(boxed(&["a"]));
        rr.append(boxed(&["a", "b"]));
        let mut counts = std::collections::HashMap::new();
        for _ in 0..4 {
            let v = rr.next().unwrap();
            *counts.entry(v).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 2);
    }
}
