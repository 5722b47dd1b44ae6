//! The crate-wide error type.
//!
//! Every variant carries the stable tag a caller is expected to match on (see
//! SPEC_FULL.md §7); `Display` always renders with the `sdr: ` prefix used
//! throughout logs so errors stay grep-able across the system.

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("sdr: service not existed")]
    ServiceNotExist,

    #[error("sdr: discovery has existed")]
    DiscoveryHasExist,

    #[error("sdr: should discovery first")]
    ShouldDiscoveryFirst,

    #[error("sdr: service unreachable")]
    ServiceUnreachable,

    #[error("sdr: parse_endpoint_path invalid endpoint path format")]
    InvalidEndpointPathFormat,

    #[error("sdr: failed alloc conn, cause conn pool closed")]
    ConnPoolClosed,

    #[error("sdr: failed close conn, cause readonly")]
    CloseReadonlyConn,

    #[error("sdr: empty load balance list")]
    EmptyBalancer,

    #[error("sdr: dial failed: {0}")]
    DialFailure(String),

    #[error("sdr: endpoint json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sdr: kv store error: {0}")]
    Kv(String),
}
