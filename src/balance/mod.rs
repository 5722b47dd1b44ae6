//! Load balancer abstraction: an ordered node list plus a selection
//! policy, behind one small strategy trait. Two policies ship here:
//! round-robin and uniform random.

mod random;
mod round_robin;

pub use random::Random;
pub use round_robin::RoundRobin;

use crate::error::{Error, Result};
use std::hash::Hash;
use std::sync::RwLock;

/// A balancer node: a key used for dedup/removal, and the value handed
/// back on selection.
pub trait Node<K, V> {
    fn key(&self) -> K;
    fn value(&self) -> V;
}

/// The capability set every balancer implementation exposes.
pub trait LoadBalance<K, V>: Send + Sync {
    fn append(&self, nodes: Vec<Box<dyn Node<K, V> + Send + Sync>>);
    fn remove(&self, key: &K) -> bool;
    fn next(&self) -> Result<V>;
}

/// Shared bookkeeping for both balancer flavors: the ordered node list
/// plus a dedup filter keyed on `K`. Neither flavor mutates this
/// concurrently with itself in a lock-free way -- selection needs to read
/// a consistent `nodes` snapshot, so a single `RwLock` guards both.
pub(crate) struct NodeStore<K, V> {
    inner: RwLock<Vec<(K, V)>>,
}

impl<K, V> NodeStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn new() -> Self {
        NodeStore { inner: RwLock::new(Vec::new()) }
    }

    fn append(&self, nodes: Vec<Box<dyn Node<K, V> + Send + Sync>>) {
        let mut guard = self.inner.write().expect("balancer lock poisoned");
        for node in nodes {
            let key = node.key();
            if guard.iter().any(|(k, _)| *k == key) {
                continue;
            }
            guard.push((key, node.value()));
        }
    }

    fn remove(&self, key: &K) -> bool {
        let mut guard = self.inner.write().expect("balancer lock poisoned");
        let before = guard.len();
        guard.retain(|(k, _)| k != key);
        guard.len() != before
    }

    fn len(&self) -> usize {
        self.inner.read().expect("balancer lock poisoned").len()
    }

    fn get(&self, idx: usize) -> Option<V> {
        self.inner.read().expect("balancer lock poisoned").get(idx).map(|(_, v)| v.clone())
    }
}

fn empty_balancer<V>() -> Result<V> {
    Err(Error::EmptyBalancer)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) struct StrNode(pub &'static str);
    impl Node<&'static str, &'static str> for StrNode {
        fn key(&self) -> &'static str {
            self.0
        }
        fn value(&self) -> &'static str {
            self.0
        }
    }

    pub(crate) fn boxed(
        keys: &[&'static str],
    ) -> Vec<Box<dyn Node<&'static str, &'static str> + Send + Sync>> {
        keys.iter().map(|k| Box::new(StrNode(k)) as Box<dyn Node<_, _> + Send + Sync>).collect()
    }
}
