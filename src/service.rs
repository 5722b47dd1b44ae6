//! Per-naming aggregate: the endpoint set, a connection pool per live
//! endpoint, and the load-balancing index over them.

use crate::balance::{LoadBalance, Node, RoundRobin};
use crate::config;
use crate::connpool::{Connection, Pool};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::kv::{Channel, Connector};
use crate::map::ConcurrentMap;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

struct EndpointNode(Arc<Endpoint>);

impl Node<String, Arc<Endpoint>> for EndpointNode {
    fn key(&self) -> String {
        self.0.id().to_string()
    }
    fn value(&self) -> Arc<Endpoint> {
        self.0.clone()
    }
}

/// The per-naming aggregate described in SPEC_FULL.md §4.5.
///
/// Invariants: every id in `alive_conn` also appears in `endpoints`;
/// `alive_conn_count` equals `alive_conn`'s cardinality; the balancer's
/// node set is a subset of `endpoints` (a pending-dial entry is in
/// `endpoints` but not yet in `alive_conn`).
pub struct Service<C: Channel> {
    naming: String,
    connector: Arc<dyn Connector<C>>,
    endpoints: ConcurrentMap<String, Arc<Endpoint>>,
    alive_conn: ConcurrentMap<String, Arc<Pool<C>>>,
    alive_conn_count: AtomicI64,
    balancer: Arc<dyn LoadBalance<String, Arc<Endpoint>>>,
}

impl<C: Channel> Service<C> {
    pub fn new(naming: impl Into<String>, connector: Arc<dyn Connector<C>>) -> Service<C> {
        Service {
            naming: naming.into(),
            connector,
            endpoints: ConcurrentMap::new(),
            alive_conn: ConcurrentMap::new(),
            alive_conn_count: AtomicI64::new(0),
            balancer: Arc::new(RoundRobin::new()),
        }
    }

    pub fn naming(&self) -> &str {
        &self.naming
    }

    pub fn with_endpoint_naming(&self, endpoint_id: &str) -> String {
        match self.endpoints.load(&endpoint_id.to_string()) {
            Some(e) => e.with_naming(&self.naming),
            None => self.naming.clone(),
        }
    }

    /// `true` iff at least one endpoint currently has a live connection
    /// pool.
    pub fn alive(&self) -> bool {
        self.alive_conn_count.load(Ordering::Acquire) != 0
    }

    /// Adds or refreshes endpoints. Endpoints already known have their
    /// `last_updated`/TTL refreshed in place (no redial). New endpoints
    /// are inserted, appended to the balancer, and dialed concurrently; a
    /// dial failure removes the endpoint from `endpoints` but -- per the
    /// open question in SPEC_FULL.md §9 -- not from the balancer, so a
    /// balancer selection can still land on a dangling node and surface
    /// `ServiceUnreachable` from `next_alive_conn`.
    pub async fn add_endpoints(&self, endpoints: Vec<Endpoint>) {
        let mut to_dial = Vec::new();

        for endpoint in endpoints {
            let id = endpoint.id().to_string();
            if let Some(existing) = self.endpoints.load(&id) {
                existing.set_last_updated(endpoint.last_updated());
                existing.set_ttl(endpoint.ttl());
                continue;
            }
            let endpoint = Arc::new(endpoint);
            self.endpoints.store(id, endpoint.clone());
            let node: Box<dyn Node<String, Arc<Endpoint>> + Send + Sync> = Box::new(EndpointNode(endpoint.clone()));
            self.balancer.append(vec![node]);
            to_dial.push(endpoint);
        }

        self.dial_endpoints(to_dial).await;
    }

    async fn dial_endpoints(&self, endpoints: Vec<Arc<Endpoint>>) {
        let dials = endpoints.into_iter().map(|endpoint| {
            let connector = self.connector.clone();
            async move {
                let capacity = config::global().conn_pool_size() as usize;
                let result = Pool::connect(endpoint.peer_address.clone(), connector, capacity).await;
                (endpoint, result)
            }
        });

        for (endpoint, result) in join_all(dials).await {
            match result {
                Ok(pool) => {
                    self.alive_conn.store(endpoint.id().to_string(), Arc::new(pool));
                    self.alive_conn_count.fetch_add(1, Ordering::AcqRel);
                }
                Err((err, dialed)) => {
                    warn!(
                        "failed to dial endpoint {} ({}): {}; closing {} partially dialed channel(s)",
                        endpoint.id(),
                        endpoint.peer_address,
                        err,
                        dialed.len()
                    );
                    for channel in dialed {
                        channel.close();
                    }
                    self.endpoints.delete(&endpoint.id().to_string());
                }
            }
        }
    }

    /// Removes endpoints from both the endpoint set and the balancer; if
    /// a pool exists for an id, closes it and decrements the alive count.
    pub fn del_endpoints(&self, ids: &[String]) {
        for id in ids {
            self.endpoints.delete(id);
            self.balancer.remove(id);
            if let Some(pool) = self.alive_conn.load_and_delete(id) {
                self.alive_conn_count.fetch_sub(1, Ordering::AcqRel);
                let _ = pool.close();
            }
        }
    }

    /// Iterates non-expired endpoints only.
    pub fn range_endpoints<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Endpoint>) -> bool,
    {
        self.endpoints.range(|_, endpoint| {
            if endpoint.expired() {
                return true;
            }
            f(endpoint)
        });
    }

    /// Balancer selection followed by a readonly allocation from that
    /// endpoint's pool. Fails `ServiceUnreachable` if the endpoint has no
    /// pool yet (still pending dial) or the balancer is empty.
    pub async fn next_alive_conn(&self) -> Result<Arc<Connection<C>>> {
        let endpoint = self.balancer.next()?;
        let pool = self.alive_conn.load(&endpoint.id().to_string()).ok_or(Error::ServiceUnreachable)?;
        pool.alloc(true).await
    }

    /// A snapshot map of endpoint-id -> freshly allocated readonly
    /// connection. Stops on the first allocation error and returns
    /// whatever was collected so far (see SPEC_FULL.md §9).
    pub async fn alive_conn(&self) -> std::collections::HashMap<String, Arc<Connection<C>>> {
        let mut pools = Vec::new();
        self.alive_conn.range(|id, pool| {
            pools.push((id.clone(), pool.clone()));
            true
        });

        let mut out = std::collections::HashMap::new();
        for (id, pool) in pools {
            match pool.alloc(true).await {
                Ok(conn) => {
                    out.insert(id, conn);
                }
                Err(_) => break,
            }
        }
        out
    }

    /// Drains `alive_conn`, closing every pool and zeroing the alive
    /// count.
    pub fn close_alive_conn(&self) {
        let mut ids = Vec::new();
        self.alive_conn.range(|id, _| {
            ids.push(id.clone());
            true
        });
        for id in ids {
            if let Some(pool) = self.alive_conn.load_and_delete(&id) {
                self.alive_conn_count.fetch_sub(1, Ordering::AcqRel);
                let _ = pool.close();
            }
        }
    }

    /// Balancer selection with up to 3 skips of expired endpoints; the
    /// 4th attempt fails `ServiceUnreachable`. Returns a fresh,
    /// caller-owned channel -- never pooled.
    pub async fn dial_context(&self) -> Result<C> {
        let mut attempts = 0;
        let endpoint = loop {
            let endpoint = self.balancer.next()?;
            if !endpoint.expired() {
                break endpoint;
            }
            attempts += 1;
            if attempts >= 4 {
                return Err(Error::ServiceUnreachable);
            }
        };
        self.connector
            .dial(&endpoint.peer_address)
            .await
            .map_err(|e| Error::DialFailure(e.0))
    }

    /// Parallel fresh dials to every non-expired endpoint. On any error,
    /// closes every channel already dialed and returns the error.
    pub async fn dial_all(&self) -> Result<std::collections::HashMap<String, C>> {
        let mut targets = Vec::new();
        self.range_endpoints(|endpoint| {
            targets.push(endpoint.clone());
            true
        });

        let connector = self.connector.clone();
        let dials = targets.into_iter().map(|endpoint| {
            let connector = connector.clone();
            async move {
                let result = connector.dial(&endpoint.peer_address).await;
                (endpoint.id().to_string(), result)
            }
        });

        let results = join_all(dials).await;
        let mut channels = std::collections::HashMap::new();
        for (id, result) in results {
            match result {
                Ok(channel) => {
                    channels.insert(id, channel);
                }
                Err(e) => {
                    for (_, channel) in channels {
                        channel.close();
                    }
                    return Err(Error::DialFailure(e.0));
                }
            }
        }
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct MockChannel(Arc<AtomicBool>);
    impl Channel for MockChannel {
        fn close(&self) {
            self.0.store(true, Ordering::Release);
        }
    }

    struct MockConnector {
        fail: std::collections::HashSet<String>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Connector<MockChannel> for MockConnector {
        async fn dial(&self, addr: &str) -> std::result::Result<MockChannel, KvError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail.contains(addr) {
                return Err(KvError(format!("refused {addr}")));
            }
            Ok(MockChannel(Arc::new(AtomicBool::new(false))))
        }
    }

    fn service(fail: &[&str]) -> Service<MockChannel> {
        let connector = Arc::new(MockConnector {
            fail: fail.iter().map(|s| s.to_string()).collect(),
            dials: AtomicUsize::new(0),
        });
        Service::new("svc.x", connector)
    }

    #[tokio::test]
    async fn add_endpoints_dials_and_marks_alive() {
        let svc = service(&[]);
        svc.add_endpoints(vec![Endpoint::new("a", "127.0.0.1:1", 30)]).await;
        assert!(svc.alive());
        assert!(svc.next_alive_conn().await.is_ok());
    }

    #[tokio::test]
    async fn failed_dial_drops_from_endpoints_but_not_balancer() {
        let svc = service(&["127.0.0.1:1"]);
        svc.add_endpoints(vec![Endpoint::new("a", "127.0.0.1:1", 30)]).await;
        assert!(!svc.alive());
        // dangling balancer node: selection succeeds but pool lookup fails.
        assert!(matches!(svc.next_alive_conn().await, Err(Error::ServiceUnreachable)));
    }

    #[tokio::test]
    async fn del_endpoints_closes_pool_and_decrements_alive_count() {
        let svc = service(&[]);
        svc.add_endpoints(vec![Endpoint::new("a", "127.0.0.1:1", 30)]).await;
        assert!(svc.alive());
        svc.del_endpoints(&["a".to_string()]);
        assert!(!svc.alive());
    }

    #[tokio::test]
    async fn add_endpoints_refreshes_existing_without_redial() {
        let svc = service(&[]);
        svc.add_endpoints(vec![Endpoint::new("a", "127.0.0.1:1", 30)]).await;
        let connector_dials_before = {
            let mut count = 0;
            svc.alive_conn.range(|_, _| {
                count += 1;
                true
            });
            count
        };
        svc.add_endpoints(vec![Endpoint::new("a", "127.0.0.1:1", 60)]).await;
        let connector_dials_after = {
            let mut count = 0;
            svc.alive_conn.range(|_, _| {
                count += 1;
                true
            });
            count
        };
        assert_eq!(connector_dials_before, connector_dials_after);
        assert_eq!(svc.endpoints.load(&"a".to_string()).unwrap().ttl(), 60);
    }

    #[tokio::test]
    async fn range_endpoints_skips_expired() {
        let svc = service(&[]);
        svc.add_endpoints(vec![Endpoint::new("a", "127.0.0.1:1", 30)]).await;
        svc.endpoints.load(&"a".to_string()).unwrap().set_last_updated(0);
        let mut seen = 0;
        svc.range_endpoints(|_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 0);
    }

    #[tokio::test]
    async fn dial_context_finds_the_fourth_attempt_when_first_three_are_expired() {
        let svc = service(&[]);
        svc.add_endpoints(vec![
            Endpoint::new("a", "127.0.0.1:1", 30),
            Endpoint::new("b", "127.0.0.1:2", 30),
            Endpoint::new("c", "127.0.0.1:3", 30),
            Endpoint::new("d", "127.0.0.1:4", 30),
        ])
        .await;
        for id in ["a", "b", "c"] {
            svc.endpoints.load(&id.to_string()).unwrap().set_last_updated(0);
        }
        // a single round robin cycle of size 4 visits every node exactly
        // once, so the lone non-expired endpoint is always reachable
        // within 4 attempts regardless of rotation offset.
        assert!(svc.dial_context().await.is_ok());
    }

    #[tokio::test]
    async fn dial_context_fails_when_all_endpoints_are_expired() {
        let svc = service(&[]);
        svc.add_endpoints(vec![
            Endpoint::new("a", "127.0.0.1:1", 30),
            Endpoint::new("b", "127.0.0.1:2", 30),
            Endpoint::new("c", "127.0.0.1:3", 30),
            Endpoint::new("d", "127.0.0.1:4", 30),
        ])
        .await;
        for id in ["a", "b", "c", "d"] {
            svc.endpoints.load(&id.to_string()).unwrap().set_last_updated(0);
        }
        assert!(matches!(svc.dial_context().await, Err(Error::ServiceUnreachable)));
    }
}
