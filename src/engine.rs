//! The discovery/registration engine: one watcher per naming, translated
//! from KV change events into `Service` mutations, plus registration,
//! keep-alive, and listener fan-out.

use crate::config;
use crate::endpoint::{parse_endpoint, parse_endpoint_path, Endpoint};
use crate::error::{Error, Result};
use crate::kv::{Channel, Connector, KvClient};
use crate::map::ConcurrentMap;
use crate::service::Service;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A listener callback invoked on every endpoint mutation for a naming:
/// `(ready, connection)` where `connection` is a shared readonly
/// allocation (or `None` if the Service currently has no alive endpoint).
pub type Listener<C> = Arc<dyn Fn(bool, Option<Arc<crate::connpool::Connection<C>>>) + Send + Sync>;

struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    // Populated by the sole winner of the `load_or_store` race right
    // after it reserves the slot, before anyone else can observe it.
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CancelHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().expect("cancel handle lock poisoned").take() {
            task.abort();
        }
    }
}

/// A handle returned by `auto_keep_alive`; dropping it does not stop the
/// driver -- call `cancel()` explicitly.
pub struct KeepAliveHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl KeepAliveHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.task.abort();
    }
}

/// Singleton watcher-per-naming discovery engine plus registration and
/// listener fan-out, generic over the KV client and RPC channel types.
pub struct Engine<C: Channel> {
    kv: Arc<dyn KvClient>,
    connector: Arc<dyn Connector<C>>,
    services: Arc<ConcurrentMap<String, Arc<Service<C>>>>,
    discoveries: Arc<ConcurrentMap<String, Arc<CancelHandle>>>,
    listeners: Arc<ConcurrentMap<String, Arc<ConcurrentMap<String, Listener<C>>>>>,
}

impl<C: Channel> Engine<C> {
    pub fn new(kv: Arc<dyn KvClient>, connector: Arc<dyn Connector<C>>) -> Engine<C> {
        Engine {
            kv,
            connector,
            services: Arc::new(ConcurrentMap::new()),
            discoveries: Arc::new(ConcurrentMap::new()),
            listeners: Arc::new(ConcurrentMap::new()),
        }
    }

    pub fn service(&self, naming: &str) -> Option<Arc<Service<C>>> {
        self.services.load(&naming.to_string())
    }

    fn service_or_create(&self, naming: &str) -> Arc<Service<C>> {
        let (service, _) = self
            .services
            .load_or_store(naming.to_string(), Arc::new(Service::new(naming, self.connector.clone())));
        service
    }

    async fn notify_state_change(&self, naming: &str) {
        let Some(listeners) = self.listeners.load(&naming.to_string()) else {
            return;
        };
        let Some(service) = self.services.load(&naming.to_string()) else {
            return;
        };
        let ready = service.alive();
        let conn = service.next_alive_conn().await.ok();
        listeners.range(|_, cb| {
            cb(ready, conn.clone());
            true
        });
    }

    /// Entry point described in SPEC_FULL.md §4.6.2: idempotent per
    /// naming, seeds the local Service from a `prefix_scan`, then spawns
    /// the watcher loop that keeps it current.
    pub async fn discovery(self: Arc<Self>, namespace: Option<String>, naming: &str) -> Result<()> {
        let service = self.service_or_create(naming);
        let cancelled = Arc::new(AtomicBool::new(false));
        let reservation = Arc::new(CancelHandle { cancelled: cancelled.clone(), task: std::sync::Mutex::new(None) });

        let (handle, existed) = self.discoveries.load_or_store(naming.to_string(), reservation);
        if existed {
            return Err(Error::DiscoveryHasExist);
        }

        let engine = self.clone();
        let naming_owned = naming.to_string();
        let ns_for_watch = namespace.clone();
        let task = tokio::spawn(async move {
            engine.discovery_daemon(ns_for_watch, naming_owned, cancelled).await;
        });
        *handle.task.lock().expect("cancel handle lock poisoned") = Some(task);

        let prefix = naming.as_bytes();
        match self
            .kv
            .prefix_scan(prefix, 0, config::MAX_ENDPOINT_SIZE, namespace.as_deref())
            .await
        {
            Ok(entries) => {
                let mut endpoints = Vec::with_capacity(entries.len());
                for entry in entries {
                    let Ok((_, id)) = parse_endpoint_path(&String::from_utf8_lossy(&entry.key)) else {
                        continue;
                    };
                    match parse_endpoint(&entry.data) {
                        Ok(endpoint) => {
                            endpoint.set_ttl(entry.ttl_secs);
                            endpoints.push(endpoint);
                        }
                        Err(e) => warn!("discovery seed: skipping malformed endpoint {id}: {e}"),
                    }
                }
                service.add_endpoints(endpoints).await;
            }
            Err(e) => warn!("discovery seed: prefix_scan failed for {naming}: {e}"),
        }

        Ok(())
    }

    async fn discovery_daemon(self: Arc<Self>, namespace: Option<String>, naming: String, cancelled: Arc<AtomicBool>) {
        let mut watcher = self.kv.new_watcher(naming.as_bytes(), namespace.as_deref());

        while !cancelled.load(Ordering::Acquire) {
            let Some(event) = watcher.notify().await else {
                break;
            };

            let key = String::from_utf8_lossy(&event.key).into_owned();
            let Ok((_, id)) = parse_endpoint_path(&key) else {
                continue;
            };

            let service = self.service_or_create(&naming);

            match event.value {
                None => {
                    service.del_endpoints(&[id]);
                }
                Some(bytes) => match parse_endpoint(&bytes) {
                    Ok(endpoint) => {
                        endpoint.set_ttl(event.ttl_secs);
                        endpoint.set_last_updated(event.timestamp_ms);
                        service.add_endpoints(vec![endpoint]).await;
                    }
                    Err(e) => {
                        warn!("discovery watch: skipping malformed endpoint {id}: {e}");
                        continue;
                    }
                },
            }

            self.notify_state_change(&naming).await;
        }

        watcher.close();
        self.discoveries.delete(&naming);
    }

    /// Best-effort batch register: endpoints that fail to `set` in the KV
    /// store are skipped, the rest still land in the local Service.
    pub async fn register(&self, namespace: Option<&str>, naming: &str, endpoints: Vec<Endpoint>) -> Result<()> {
        let service = self.service_or_create(naming);
        let mut accepted = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let key = endpoint.with_naming(naming);
            let ttl = endpoint.ttl();
            match endpoint.marshal() {
                Ok(bytes) => match self.kv.set(key.as_bytes(), &bytes, ttl, namespace).await {
                    Ok(()) => accepted.push(endpoint),
                    Err(e) => warn!("register: kv set failed for {}: {}", endpoint.id(), e),
                },
                Err(e) => warn!("register: marshal failed for {}: {}", endpoint.id(), e),
            }
        }

        service.add_endpoints(accepted).await;
        Ok(())
    }

    pub async fn unregister(&self, namespace: Option<&str>, naming: &str, ids: &[String]) -> Result<()> {
        let service = self.services.load(&naming.to_string()).ok_or(Error::ServiceNotExist)?;
        for id in ids {
            let key = format!("{naming}::{id}");
            self.kv.delete(key.as_bytes(), namespace).await?;
            service.del_endpoints(std::slice::from_ref(id));
        }
        Ok(())
    }

    /// Registers `endpoint` once, then spawns a background task that
    /// re-registers it every `ttl/4` seconds until the returned handle is
    /// cancelled.
    pub async fn auto_keep_alive(
        self: Arc<Self>,
        namespace: Option<String>,
        naming: String,
        endpoint: Endpoint,
    ) -> Result<KeepAliveHandle> {
        self.register(namespace.as_deref(), &naming, vec![endpoint_clone(&endpoint)]).await?;

        let period_secs = (endpoint.ttl() / 4).max(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_task = cancelled.clone();
        let engine = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period_secs as u64));
            ticker.tick().await; // first tick fires immediately; skip it, register already ran.
            loop {
                ticker.tick().await;
                if cancelled_for_task.load(Ordering::Acquire) {
                    break;
                }
                endpoint.touch();
                if let Err(e) = engine
                    .register(namespace.as_deref(), &naming, vec![endpoint_clone(&endpoint)])
                    .await
                {
                    warn!("keep-alive: re-register failed for {naming}: {e}");
                }
            }
        });

        Ok(KeepAliveHandle { cancelled, task })
    }

    /// Requires an active discovery for `naming`.
    pub fn use_listener(&self, naming: &str, callback: Listener<C>) -> Result<String> {
        if !self.discoveries.exist(&naming.to_string()) {
            return Err(Error::ShouldDiscoveryFirst);
        }
        let (bucket, _) = self
            .listeners
            .load_or_store(naming.to_string(), Arc::new(ConcurrentMap::new()));
        let id = Uuid::new_v4().to_string();
        bucket.store(id.clone(), callback);
        Ok(id)
    }

    pub fn destroy_listener(&self, naming: &str, id: &str) {
        if let Some(bucket) = self.listeners.load(&naming.to_string()) {
            bucket.delete(&id.to_string());
        }
    }

    /// Cancels the watcher for a single naming, leaving every other
    /// naming's watcher running. A no-op if `naming` has no active
    /// discovery.
    pub fn release_discovery(&self, naming: &str) {
        if let Some(handle) = self.discoveries.load_and_delete(&naming.to_string()) {
            handle.cancel();
        }
    }

    /// Closes every Service (pools, then their channels), then closes the
    /// KV client.
    pub async fn close(&self) -> Result<()> {
        let mut names = Vec::new();
        self.discoveries.range(|k, _| {
            names.push(k.clone());
            true
        });
        for naming in names {
            if let Some(handle) = self.discoveries.load_and_delete(&naming) {
                handle.cancel();
            }
        }

        let mut services = Vec::new();
        self.services.range(|_, service| {
            services.push(service.clone());
            true
        });
        for service in services {
            service.close_alive_conn();
        }

        self.kv.close().await?;
        Ok(())
    }
}

fn endpoint_clone(e: &Endpoint) -> Endpoint {
    let mut clone = Endpoint::new(e.id().to_string(), e.peer_address.clone(), e.ttl());
    clone.set_last_updated(e.last_updated());
    if let Some(md) = &e.metadata {
        let _ = clone.put_metadata(&crate::endpoint::RawMetadata(md.clone()));
    }
    clone
}
