use super::{empty_balancer, LoadBalance, Node, NodeStore};
use crate::error::Result;
use rand::Rng;
use std::hash::Hash;

/// Uniform random selection over the current node set.
pub struct Random<K, V> {
    store: NodeStore<K, V>,
}

impl<K, V> Random<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Random { store: NodeStore::new() }
    }
}

impl<K, V> Default for Random<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LoadBalance<K, V> for Random<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn append(&self, nodes: Vec<Box<dyn Node<K, V> + Send + Sync>>) {
        self.store.append(nodes);
    }

    fn remove(&self, key: &K) -> bool {
        self.store.remove(key)
    }

    fn next(&self) -> Result<V> {
        let size = self.store.len();
        if size == 0 {
            return empty_balancer();
        }
        let idx = rand::thread_rng().gen_range(0..size);
        Ok(self.store.get(idx).expect("index within bounds"))
    }
}
