//! External collaborator contracts: the remote KV store and the RPC
//! transport used to dial endpoints.
//!
//! Neither is implemented here — both are assumed available and are only
//! contractually described, generic over the resolution source and the
//! dial target rather than hard-wiring a single transport.

use async_trait::async_trait;
use std::fmt;

/// A single change event observed on a watched key prefix.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: Vec<u8>,
    /// `None` signals a delete (the key's TTL expired or was removed).
    pub value: Option<Vec<u8>>,
    pub timestamp_ms: i64,
    pub ttl_secs: u32,
}

/// One record returned by a `prefix_scan`.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub ttl_secs: u32,
}

/// A live subscription to change events under a watched prefix.
///
/// `notify` yields events in arrival order; `close` is idempotent and
/// causes any in-flight `notify` to return `None`.
#[async_trait]
pub trait Watcher: Send {
    async fn notify(&mut self) -> Option<WatchEvent>;
    fn close(&mut self);
}

/// The remote KV store's client contract.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn set(
        &self,
        key: &[u8],
        value: &[u8],
        ttl_secs: u32,
        namespace: Option<&str>,
    ) -> Result<(), KvError>;

    async fn delete(&self, key: &[u8], namespace: Option<&str>) -> Result<(), KvError>;

    async fn prefix_scan(
        &self,
        prefix: &[u8],
        offset: u64,
        limit: u64,
        namespace: Option<&str>,
    ) -> Result<Vec<ScanEntry>, KvError>;

    /// Opens a watcher over `prefix`, scoped to `namespace`. The returned
    /// watcher is already subscribed; `watch_prefix` in the original
    /// contract (a blocking "drive this watcher" call) is folded into
    /// `Watcher::notify` itself here, since an async `Stream`-shaped
    /// watcher needs no separate driver task.
    fn new_watcher(&self, prefix: &[u8], namespace: Option<&str>) -> Box<dyn Watcher>;

    /// Closes the underlying client connection.
    async fn close(&self) -> Result<(), KvError>;
}

/// Opaque error from the external KV client. The core never matches on
/// its internals, only wraps and propagates it.
#[derive(Debug, Clone)]
pub struct KvError(pub String);

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for KvError {}

impl From<KvError> for crate::error::Error {
    fn from(e: KvError) -> Self {
        crate::error::Error::Kv(e.0)
    }
}

/// A long-lived RPC channel to a single endpoint address.
pub trait Channel: Send + Sync + 'static {
    /// Closes the underlying transport. Best-effort; errors are not
    /// actionable by the pool and are only logged.
    fn close(&self);
}

/// Dials fresh RPC channels. Generic over the channel type so this crate
/// never depends on a concrete RPC library.
#[async_trait]
pub trait Connector<C: Channel>: Send + Sync {
    async fn dial(&self, peer_address: &str) -> Result<C, KvError>;
}
