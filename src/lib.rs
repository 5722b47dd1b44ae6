//! Client-side service discovery and registration over a TTL-bound
//! key-value store with prefix-watch support.
//!
//! A caller registers endpoints under a naming, optionally keeps them
//! alive on a TTL/4 cadence, and discovers other namings' endpoints
//! through a watched prefix; a per-naming [`Service`] load-balances
//! pooled connections across whatever is currently alive.

#[macro_use]
extern crate log;

mod balance;
mod client;
mod config;
mod connpool;
mod endpoint;
mod engine;
mod error;
mod kv;
mod map;
mod service;

pub use balance::{LoadBalance, Node, Random, RoundRobin};
pub use client::Client;
pub use config::{global as config, Config};
pub use connpool::{Connection, Pool};
pub use endpoint::{parse_endpoint, parse_endpoint_path, Endpoint, EndpointMetadata, KvMetadata, RawMetadata};
pub use engine::{Engine, KeepAliveHandle, Listener};
pub use error::{Error, Result};
pub use kv::{Channel, Connector, KvClient, KvError, ScanEntry, WatchEvent, Watcher};
pub use map::ConcurrentMap;
pub use service::Service;
