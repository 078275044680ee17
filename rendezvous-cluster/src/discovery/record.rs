//! Service records as stored in the backend and mirrored in memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::hasher::hash_endpoint;

/// One registered service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    /// Backend-assigned identifier
    pub id: String,
    pub service_name: String,
    pub endpoint: String,
    /// Always `hash_endpoint(endpoint)`
    pub endpoint_hash: String,
    pub balancer: Option<String>,
    /// Time of the last heartbeat write
    pub timestamp: DateTime<Utc>,
    /// Declared heartbeat period in milliseconds
    #[serde(rename = "pingInterval")]
    pub ping_interval_ms: u64,
}

impl ServiceRecord {
    /// Build a record, deriving the endpoint hash from the endpoint
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
        timestamp: DateTime<Utc>,
        ping_interval_ms: u64,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            id: id.into(),
            service_name: service_name.into(),
            endpoint_hash: hash_endpoint(&endpoint),
            endpoint,
            balancer: None,
            timestamp,
            ping_interval_ms,
        }
    }

    #[must_use]
    pub fn with_balancer(mut self, balancer: impl Into<String>) -> Self {
        self.balancer = Some(balancer.into());
        self
    }

    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.service_name.clone(), self.endpoint.clone())
    }
}

/// Upsert selector: a service instance is identified by its name and endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub service_name: String,
    pub endpoint: String,
}

impl RecordKey {
    #[must_use]
    pub fn new(service_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_name, self.endpoint)
    }
}

/// Identity fields, written only with the first heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    pub endpoint_hash: String,
    /// `None` clears any balancer left by a previous registration
    pub balancer: Option<String>,
}

/// Fields written by one heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub timestamp: DateTime<Utc>,
    pub ping_interval_ms: u64,
    pub identity: Option<RecordIdentity>,
}

impl HeartbeatPayload {
    /// Liveness-only refresh
    #[must_use]
    pub const fn partial(timestamp: DateTime<Utc>, ping_interval_ms: u64) -> Self {
        Self {
            timestamp,
            ping_interval_ms,
            identity: None,
        }
    }

    /// First heartbeat, carrying the identity fields as well
    #[must_use]
    pub fn full(
        timestamp: DateTime<Utc>,
        ping_interval_ms: u64,
        identity: RecordIdentity,
    ) -> Self {
        Self {
            timestamp,
            ping_interval_ms,
            identity: Some(identity),
        }
    }
}

/// Which in-memory store a watcher feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Every live record
    Endpoints,
    /// Live records that carry a balancer
    Balancers,
}

impl StoreKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Endpoints => "endpoints",
            Self::Balancers => "balancers",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership change observed by one watch cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub store_kind: StoreKind,
    pub removed: Vec<ServiceRecord>,
    pub added: Vec<ServiceRecord>,
    /// Every healthy record seen by the cycle
    pub all: Vec<ServiceRecord>,
}

impl ChangeEvent {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
