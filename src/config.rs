//! Process-wide configuration knobs, mutated at runtime through atomics
//! rather than fixed at process start, since pool capacity and namespace
//! may reasonably change between registrations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

/// Upper bound on the number of records a single `prefix_scan` may return
/// when seeding a newly discovered naming.
pub const MAX_ENDPOINT_SIZE: u64 = 8192;

const DEFAULT_CONN_POOL_SIZE: u32 = 32;

/// Process-wide knobs read atomically at the point of use. Changes affect
/// future pool creations and registrations only; live pools keep their
/// capacity.
pub struct Config {
    pool_size: AtomicU32,
    namespace: RwLock<Option<String>>,
}

impl Config {
    fn new() -> Config {
        Config {
            pool_size: AtomicU32::new(DEFAULT_CONN_POOL_SIZE),
            namespace: RwLock::new(None),
        }
    }

    pub fn conn_pool_size(&self) -> u32 {
        self.pool_size.load(Ordering::Acquire)
    }

    pub fn set_conn_pool_size(&self, size: u32) {
        self.pool_size.store(size, Ordering::Release);
    }

    pub fn namespace(&self) -> Option<String> {
        self.namespace.read().expect("namespace lock poisoned").clone()
    }

    pub fn set_namespace(&self, namespace: Option<String>) {
        *self.namespace.write().expect("namespace lock poisoned") = namespace;
    }
}

static CONFIG: std::sync::OnceLock<Config> = std::sync::OnceLock::new();

/// The process-wide configuration singleton.
pub fn global() -> &'static Config {
    CONFIG.get_or_init(Config::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_size() {
        assert_eq!(global().conn_pool_size(), DEFAULT_CONN_POOL_SIZE);
    }

    #[test]
    fn namespace_roundtrip() {
        global().set_namespace(Some("ns-a".into()));
        assert_eq!(global().namespace().as_deref(), Some("ns-a"));
        global().set_namespace(None);
        assert_eq!(global().namespace(), None);
    }
}
