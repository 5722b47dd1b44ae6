//! The facade a caller constructs: wraps a KV client handle and an RPC
//! connector, owns the discovery/registration engine, and exposes its
//! capability set directly.

use crate::config;
use crate::endpoint::Endpoint;
use crate::engine::{Engine, KeepAliveHandle, Listener};
use crate::error::Result;
use crate::kv::{Channel, Connector, KvClient};
use crate::service::Service;
use std::sync::Arc;

/// The entry point for discovery and registration, generic over the RPC
/// channel type dialed by the supplied `Connector`.
pub struct Client<C: Channel> {
    engine: Arc<Engine<C>>,
}

impl<C: Channel> Client<C> {
    /// Wraps an existing KV client handle.
    pub fn new(kv: Arc<dyn KvClient>, connector: Arc<dyn Connector<C>>) -> Client<C> {
        Client { engine: Arc::new(Engine::new(kv, connector)) }
    }

    /// Sets the process-wide default namespace used by calls that pass
    /// `None` for their own namespace argument.
    pub fn set_namespace(&self, namespace: Option<String>) {
        config::global().set_namespace(namespace);
    }

    pub fn namespace(&self) -> Option<String> {
        config::global().namespace()
    }

    /// The local `Service` for `naming`, if discovery or registration has
    /// created one.
    pub fn service(&self, naming: &str) -> Option<Arc<Service<C>>> {
        self.engine.service(naming)
    }

    pub async fn discovery(&self, namespace: Option<String>, naming: &str) -> Result<()> {
        self.engine.clone().discovery(namespace, naming).await
    }

    pub async fn register(&self, namespace: Option<&str>, naming: &str, endpoints: Vec<Endpoint>) -> Result<()> {
        self.engine.register(namespace, naming, endpoints).await
    }

    pub async fn unregister(&self, namespace: Option<&str>, naming: &str, ids: &[String]) -> Result<()> {
        self.engine.unregister(namespace, naming, ids).await
    }

    pub async fn auto_keep_alive(
        &self,
        namespace: Option<String>,
        naming: String,
        endpoint: Endpoint,
    ) -> Result<KeepAliveHandle> {
        self.engine.clone().auto_keep_alive(namespace, naming, endpoint).await
    }

    pub fn use_listener(&self, naming: &str, callback: Listener<C>) -> Result<String> {
        self.engine.use_listener(naming, callback)
    }

    pub fn destroy_listener(&self, naming: &str, id: &str) {
        self.engine.destroy_listener(naming, id)
    }

    /// Cancels the watcher for a single naming, leaving every other
    /// naming's watcher running. A no-op if `naming` has no active
    /// discovery.
    pub fn release_discovery(&self, naming: &str) {
        self.engine.release_discovery(naming)
    }

    /// Closes every Service's connection pools (and so their channels),
    /// then closes the underlying KV client.
    pub async fn close(&self) -> Result<()> {
        self.engine.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvError, ScanEntry, WatchEvent, Watcher};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct MockChannel;
    impl Channel for MockChannel {
        fn close(&self) {}
    }

    struct MockConnector;
    #[async_trait]
    impl Connector<MockChannel> for MockConnector {
        async fn dial(&self, _addr: &str) -> std::result::Result<MockChannel, KvError> {
            Ok(MockChannel)
        }
    }

    struct MockWatcher(mpsc::UnboundedReceiver<WatchEvent>);
    #[async_trait]
    impl Watcher for MockWatcher {
        async fn notify(&mut self) -> Option<WatchEvent> {
            self.0.recv().await
        }
        fn close(&mut self) {
            self.0.close();
        }
    }

    struct MockKv {
        records: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
        events: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    }

    #[async_trait]
    impl KvClient for MockKv {
        async fn set(&self, key: &[u8], value: &[u8], _ttl: u32, _ns: Option<&str>) -> std::result::Result<(), KvError> {
            self.records.lock().unwrap().insert(key.to_vec(), value.to_vec());
            Ok(())
        }
        async fn delete(&self, key: &[u8], _ns: Option<&str>) -> std::result::Result<(), KvError> {
            self.records.lock().unwrap().remove(key);
            Ok(())
        }
        async fn prefix_scan(
            &self,
            prefix: &[u8],
            _offset: u64,
            _limit: u64,
            _ns: Option<&str>,
        ) -> std::result::Result<Vec<ScanEntry>, KvError> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ScanEntry { key: k.clone(), data: v.clone(), ttl_secs: 30 })
                .collect())
        }
        fn new_watcher(&self, _prefix: &[u8], _ns: Option<&str>) -> Box<dyn Watcher> {
            let rx = self.events.lock().unwrap().take().expect("single watcher per test");
            Box::new(MockWatcher(rx))
        }
        async fn close(&self) -> std::result::Result<(), KvError> {
            Ok(())
        }
    }

    fn client_with(events: mpsc::UnboundedReceiver<WatchEvent>) -> Client<MockChannel> {
        let kv = Arc::new(MockKv { records: Mutex::new(HashMap::new()), events: Mutex::new(Some(events)) });
        Client::new(kv, Arc::new(MockConnector))
    }

    #[tokio::test]
    async fn discovery_seeds_from_prefix_scan_and_watch_adds_endpoint() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let client = client_with(rx);
        client.discovery(None, "svc.orders").await.unwrap();
        assert!(client.service("svc.orders").is_some());
    }

    #[tokio::test]
    async fn register_then_unregister_round_trips_locally() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let client = client_with(rx);
        client
            .register(None, "svc.orders", vec![Endpoint::new("ep-1", "10.0.0.1:1", 30)])
            .await
            .unwrap();
        let service = client.service("svc.orders").unwrap();
        assert!(service.alive());

        client.unregister(None, "svc.orders", &["ep-1".to_string()]).await.unwrap();
        assert!(!service.alive());
    }

    #[tokio::test]
    async fn second_discovery_call_is_rejected() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let client = client_with(rx);
        client.discovery(None, "svc.orders").await.unwrap();
        let err = client.discovery(None, "svc.orders").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::DiscoveryHasExist));
    }

    #[tokio::test]
    async fn listener_requires_active_discovery() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let client = client_with(rx);
        let err = client.use_listener("svc.orders", Arc::new(|_, _| {})).unwrap_err();
        assert!(matches!(err, crate::error::Error::ShouldDiscoveryFirst));
    }
}
