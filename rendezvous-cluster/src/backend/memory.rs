//! In-process discovery backend
//!
//! Holds records in a map behind a lock. Several engines in one process can
//! share a single instance through an `Arc`, which makes it the rendezvous
//! point for tests, simulations and single-node deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{DiscoveryBackend, QueryOptions, RecordFilter};
use crate::discovery::record::{HeartbeatPayload, RecordKey, ServiceRecord};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<String, ServiceRecord>,
    ids: HashMap<RecordKey, String>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    records: RwLock<Records>,
    available: AtomicBool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every subsequent call fail with `BackendUnavailable` (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored records, live or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable(
                "memory backend marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, key: &RecordKey, payload: &HeartbeatPayload) -> Result<()> {
        self.ensure_available()?;

        let mut records = self.records.write();
        let id = records
            .ids
            .entry(key.clone())
            .or_insert_with(|| nanoid::nanoid!())
            .clone();

        let record = records.by_id.entry(id.clone()).or_insert_with(|| {
            ServiceRecord::new(
                id,
                key.service_name.clone(),
                key.endpoint.clone(),
                payload.timestamp,
                payload.ping_interval_ms,
            )
        });

        record.timestamp = payload.timestamp;
        record.ping_interval_ms = payload.ping_interval_ms;
        if let Some(identity) = &payload.identity {
            record.endpoint_hash.clone_from(&identity.endpoint_hash);
            record.balancer.clone_from(&identity.balancer);
        }

        Ok(())
    }

    async fn query(
        &self,
        filter: RecordFilter,
        options: QueryOptions,
    ) -> Result<Vec<ServiceRecord>> {
        self.ensure_available()?;

        let records = self.records.read();
        let mut matched: Vec<ServiceRecord> = records
            .by_id
            .values()
            .filter(|record| match filter {
                RecordFilter::All => true,
                RecordFilter::WithBalancer => record.balancer.is_some(),
            })
            .cloned()
            .collect();

        if options.newest_first {
            matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        } else {
            matched.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        }
        matched.truncate(options.limit);

        Ok(matched)
    }

    async fn disconnect(&self) -> Result<()> {
        // Nothing to release; the map may still be shared with other engines
        tracing::debug!("Memory discovery backend detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::hasher::hash_endpoint;
    use crate::discovery::record::RecordIdentity;
    use chrono::{TimeDelta, Utc};

    fn identity(endpoint: &str, balancer: Option<&str>) -> RecordIdentity {
        RecordIdentity {
            endpoint_hash: hash_endpoint(endpoint),
            balancer: balancer.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates_in_place() {
        let backend = MemoryBackend::new();
        let key = RecordKey::new("api", "http://h1:3000");
        let first = Utc::now();

        backend
            .upsert(
                &key,
                &HeartbeatPayload::full(first, 5000, identity("http://h1:3000", Some("http://lb"))),
            )
            .await
            .unwrap();
        let created = backend.query(RecordFilter::All, QueryOptions::default()).await.unwrap();
        assert_eq!(created.len(), 1);

        let later = first + TimeDelta::seconds(5);
        backend
            .upsert(&key, &HeartbeatPayload::partial(later, 5000))
            .await
            .unwrap();
        let updated = backend.query(RecordFilter::All, QueryOptions::default()).await.unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, created[0].id);
        assert_eq!(updated[0].timestamp, later);
        // Partial heartbeat keeps identity fields
        assert_eq!(updated[0].balancer.as_deref(), Some("http://lb"));
        assert_eq!(updated[0].endpoint_hash, hash_endpoint("http://h1:3000"));
    }

    #[tokio::test]
    async fn test_query_orders_filters_and_limits() {
        let backend = MemoryBackend::new();
        let now = Utc::now();

        for i in 0..5_i64 {
            let endpoint = format!("http://h{i}:3000");
            let balancer = (i % 2 == 0).then(|| format!("http://lb{i}"));
            backend
                .upsert(
                    &RecordKey::new("api", endpoint.clone()),
                    &HeartbeatPayload::full(
                        now + TimeDelta::seconds(i),
                        5000,
                        identity(&endpoint, balancer.as_deref()),
                    ),
                )
                .await
                .unwrap();
        }

        let newest = backend
            .query(RecordFilter::All, QueryOptions { newest_first: true, limit: 3 })
            .await
            .unwrap();
        let endpoints: Vec<_> = newest.iter().map(|r| r.endpoint.as_str()).collect();
        assert_eq!(endpoints, ["http://h4:3000", "http://h3:3000", "http://h2:3000"]);

        let balancers = backend
            .query(RecordFilter::WithBalancer, QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(balancers.len(), 3);
        assert!(balancers.iter().all(|r| r.balancer.is_some()));
    }

    #[tokio::test]
    async fn test_full_payload_clears_balancer() {
        let backend = MemoryBackend::new();
        let key = RecordKey::new("api", "http://h1:3000");
        let now = Utc::now();

        backend
            .upsert(&key, &HeartbeatPayload::full(now, 5000, identity("http://h1:3000", Some("http://lb"))))
            .await
            .unwrap();
        backend
            .upsert(&key, &HeartbeatPayload::full(now, 5000, identity("http://h1:3000", None)))
            .await
            .unwrap();

        let balancers = backend
            .query(RecordFilter::WithBalancer, QueryOptions::default())
            .await
            .unwrap();
        assert!(balancers.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_calls() {
        let backend = MemoryBackend::new();
        backend.set_available(false);

        let err = backend
            .query(RecordFilter::All, QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));

        backend.set_available(true);
        assert!(backend.query(RecordFilter::All, QueryOptions::default()).await.is_ok());
    }
}
