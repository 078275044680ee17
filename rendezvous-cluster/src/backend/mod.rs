//! Discovery backend abstraction and implementations
//!
//! The engine only talks to the shared store through [`DiscoveryBackend`].
//! [`connect`] picks an implementation from the URL scheme.

pub mod memory;
pub mod redis_backend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::discovery::record::{HeartbeatPayload, RecordKey, ServiceRecord};
use crate::error::{Error, Result};

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

/// Which records a query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    /// Only records carrying a balancer
    WithBalancer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Order by heartbeat timestamp, newest first
    pub newest_first: bool,
    pub limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            newest_first: true,
            limit: 100,
        }
    }
}

/// Options shared by every backend
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Prefix for every key the backend writes
    pub key_prefix: String,
    /// Upper bound on a single backend call
    pub operation_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            key_prefix: "rendezvous:".to_string(),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared store where instances publish and discover each other
///
/// Implementations must make `upsert` idempotent: the first call for a key
/// creates the record, later calls update it in place. `disconnect` must be
/// safe to call more than once.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Create or update the record for `key`
    async fn upsert(&self, key: &RecordKey, payload: &HeartbeatPayload) -> Result<()>;

    /// Read up to `options.limit` records matching `filter`
    async fn query(&self, filter: RecordFilter, options: QueryOptions)
        -> Result<Vec<ServiceRecord>>;

    /// Release the connection
    async fn disconnect(&self) -> Result<()>;
}

/// Connect to the backend named by the URL scheme
///
/// - `redis://` / `rediss://` connect to Redis
/// - `memory://` creates a private in-process store
pub async fn connect(url: &str, options: &BackendOptions) -> Result<Arc<dyn DiscoveryBackend>> {
    let parsed = Url::parse(url)
        .map_err(|e| Error::Configuration(format!("connect url should be an url ({url}): {e}")))?;

    match parsed.scheme() {
        "redis" | "rediss" => {
            let backend = RedisBackend::connect(url, options.clone()).await?;
            Ok(Arc::new(backend))
        }
        "memory" => Ok(Arc::new(MemoryBackend::new())),
        other => Err(Error::Configuration(format!(
            "no discovery backend named {other}"
        ))),
    }
}
