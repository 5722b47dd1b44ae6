//! Endpoint records: one advertised instance of a naming, its wire key
//! format, and the metadata producer trait.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// One advertised instance of a naming.
///
/// `ttl` and `last_updated` are mutated independently of the rest of the
/// struct (by the watcher loop and the keep-alive driver respectively),
/// so they live behind atomics rather than requiring `&mut self` for
/// every refresh.
#[derive(Debug, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(skip)]
    ttl_secs: AtomicU32,
    #[serde(skip)]
    last_updated_ms: AtomicI64,

    pub id: String,
    #[serde(rename = "peer-addr")]
    pub peer_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

impl Endpoint {
    pub fn new(id: impl Into<String>, peer_address: impl Into<String>, ttl_secs: u32) -> Endpoint {
        Endpoint {
            ttl_secs: AtomicU32::new(ttl_secs),
            last_updated_ms: AtomicI64::new(now_ms()),
            id: id.into(),
            peer_address: peer_address.into(),
            metadata: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_ttl(&self, ttl_secs: u32) {
        self.ttl_secs.store(ttl_secs, Ordering::Release);
    }

    pub fn ttl(&self) -> u32 {
        self.ttl_secs.load(Ordering::Acquire)
    }

    pub fn last_updated(&self) -> i64 {
        self.last_updated_ms.load(Ordering::Acquire)
    }

    pub fn set_last_updated(&self, ms: i64) {
        self.last_updated_ms.store(ms, Ordering::Release);
    }

    pub fn touch(&self) {
        self.set_last_updated(now_ms());
    }

    /// `true` iff `now > last_updated + ttl * 1000`.
    pub fn expired(&self) -> bool {
        now_ms() > self.last_updated() + (self.ttl() as i64) * 1000
    }

    /// The wire-level key this endpoint is stored under for `naming`:
    /// `"<naming>::<id>"`.
    pub fn with_naming(&self, naming: &str) -> String {
        format!("{}::{}", naming, self.id)
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn put_metadata(&mut self, md: &dyn EndpointMetadata) -> Result<()> {
        self.metadata = Some(md.entry()?);
        Ok(())
    }
}

/// Parses a JSON-encoded `Endpoint`. TTL and `last_updated` are not part
/// of the wire format -- they ride on the KV event envelope -- so a
/// freshly parsed endpoint always carries TTL 0 and `last_updated = now`
/// until the caller stamps them from that envelope.
pub fn parse_endpoint(bytes: &[u8]) -> Result<Endpoint> {
    #[derive(Deserialize)]
    struct Wire {
        id: String,
        #[serde(rename = "peer-addr")]
        peer_address: String,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    }
    let wire: Wire = serde_json::from_slice(bytes)?;
    Ok(Endpoint {
        ttl_secs: AtomicU32::new(0),
        last_updated_ms: AtomicI64::new(now_ms()),
        id: wire.id,
        peer_address: wire.peer_address,
        metadata: wire.metadata,
    })
}

/// Splits `"<naming>::<id>"` into its two halves. Fails unless the
/// separator occurs exactly once with non-empty halves on both sides.
pub fn parse_endpoint_path(path: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = path.split("::").collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(Error::InvalidEndpointPathFormat);
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// Produces the opaque metadata bytes stored on an `Endpoint`. The core
/// never inspects the shape; only producers (this trait's implementors)
/// impose one.
pub trait EndpointMetadata {
    fn entry(&self) -> Result<serde_json::Value>;
}

/// A string-keyed map producer, mirroring the original KV-metadata
/// helper: callers build up key/value pairs and the entry is their JSON
/// object encoding.
#[derive(Default)]
pub struct KvMetadata {
    entries: std::collections::HashMap<String, serde_json::Value>,
}

impl KvMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

impl EndpointMetadata for KvMetadata {
    fn entry(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.entries)?)
    }
}

/// A passthrough producer for metadata that is already shaped JSON.
pub struct RawMetadata(pub serde_json::Value);

impl EndpointMetadata for RawMetadata {
    fn entry(&self) -> Result<serde_json::Value> {
        Ok(self.0.clone())
    }
}
