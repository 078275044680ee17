//! In-memory registry of live service records
//!
//! Records are keyed by backend id, with secondary indices by service name,
//! endpoint hash and balancer. Every mutation keeps all indices in step with
//! the primary map.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use rand::RngExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::hasher::hash_distance;
use super::health::HealthEvaluator;
use super::record::ServiceRecord;

/// A store shared between its watcher (the only writer) and pickers
pub type SharedStore = Arc<RwLock<DiscoveryStore>>;

#[derive(Debug, Default, Clone)]
pub struct DiscoveryStore {
    records: HashMap<String, ServiceRecord>,
    by_service: HashMap<String, BTreeSet<String>>,
    by_endpoint_hash: HashMap<String, String>,
    by_balancer: HashMap<String, String>,
}

impl DiscoveryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ServiceRecord> {
        self.records.get(id)
    }

    /// Insert or replace the record stored under `id`
    pub fn set(&mut self, id: &str, record: ServiceRecord) {
        if let Some(previous) = self.records.remove(id) {
            self.unindex(id, &previous);
        }

        self.by_service
            .entry(record.service_name.clone())
            .or_default()
            .insert(id.to_string());
        self.by_endpoint_hash
            .insert(record.endpoint_hash.clone(), id.to_string());
        if let Some(balancer) = &record.balancer {
            self.by_balancer.insert(balancer.clone(), id.to_string());
        }

        self.records.insert(id.to_string(), record);
    }

    /// Remove a record from the primary map and every index
    pub fn remove(&mut self, id: &str) -> Option<ServiceRecord> {
        let record = self.records.remove(id)?;
        self.unindex(id, &record);
        Some(record)
    }

    /// Snapshot of every record, in no particular order
    #[must_use]
    pub fn get_all(&self) -> Vec<ServiceRecord> {
        self.records.values().cloned().collect()
    }

    #[must_use]
    pub fn ids(&self) -> BTreeSet<String> {
        self.records.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn by_endpoint_hash(&self, hash: &str) -> Option<&ServiceRecord> {
        self.by_endpoint_hash
            .get(hash)
            .and_then(|id| self.records.get(id))
    }

    #[must_use]
    pub fn by_balancer(&self, balancer: &str) -> Option<&ServiceRecord> {
        self.by_balancer
            .get(balancer)
            .and_then(|id| self.records.get(id))
    }

    /// Records registered under `service_name`, ordered by id
    #[must_use]
    pub fn by_service(&self, service_name: &str) -> Vec<&ServiceRecord> {
        self.by_service
            .get(service_name)
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    /// Evict every record the evaluator judges stale at `now`.
    ///
    /// Returns the evicted records.
    pub fn evict_unhealthy(
        &mut self,
        health: &HealthEvaluator,
        now: DateTime<Utc>,
    ) -> Vec<ServiceRecord> {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| !health.is_healthy(record, now))
            .map(|(id, _)| id.clone())
            .collect();

        stale.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Uniform pick, optionally restricted to one service
    #[must_use]
    pub fn get_random(&self, service_name: Option<&str>) -> Option<&ServiceRecord> {
        let candidates = self.candidates(service_name);
        candidates.choose(&mut rand::rng()).copied()
    }

    /// Sticky pick biased toward the candidate closest to `caller_hash`.
    ///
    /// With probability `weight` the closest candidate is returned, otherwise a
    /// uniform pick over all candidates. Weight 1 is deterministic for a fixed
    /// candidate set, weight 0 is uniform. Weights above 1 are treated as 1;
    /// negative or NaN weights fall back to [`Self::get_random`].
    #[must_use]
    pub fn get_random_weighted(
        &self,
        service_name: &str,
        caller_hash: &str,
        weight: f64,
    ) -> Option<&ServiceRecord> {
        if weight.is_nan() || weight < 0.0 {
            return self.get_random(Some(service_name));
        }

        let candidates = self.candidates(Some(service_name));
        let closest = candidates.iter().copied().min_by(|a, b| {
            hash_distance(caller_hash, &a.endpoint_hash)
                .cmp(&hash_distance(caller_hash, &b.endpoint_hash))
                .then_with(|| a.id.cmp(&b.id))
        })?;

        let mut rng = rand::rng();
        if rng.random_bool(weight.min(1.0)) {
            Some(closest)
        } else {
            candidates.choose(&mut rng).copied()
        }
    }

    fn candidates(&self, service_name: Option<&str>) -> Vec<&ServiceRecord> {
        match service_name {
            Some(name) => self.by_service(name),
            None => self.records.values().collect(),
        }
    }

    fn unindex(&mut self, id: &str, record: &ServiceRecord) {
        if let Some(ids) = self.by_service.get_mut(&record.service_name) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_service.remove(&record.service_name);
            }
        }

        if self.by_endpoint_hash.get(&record.endpoint_hash).map(String::as_str) == Some(id) {
            self.by_endpoint_hash.remove(&record.endpoint_hash);
            // Same endpoint registered under another service name
            if let Some((other_id, _)) = self
                .records
                .iter()
                .find(|(_, other)| other.endpoint_hash == record.endpoint_hash)
            {
                self.by_endpoint_hash
                    .insert(record.endpoint_hash.clone(), other_id.clone());
            }
        }

        if let Some(balancer) = &record.balancer {
            if self.by_balancer.get(balancer).map(String::as_str) == Some(id) {
                self.by_balancer.remove(balancer);
                if let Some((other_id, _)) = self
                    .records
                    .iter()
                    .find(|(_, other)| other.balancer.as_ref() == Some(balancer))
                {
                    self.by_balancer.insert(balancer.clone(), other_id.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::hasher::hash_endpoint;
    use chrono::TimeDelta;
    use std::collections::HashMap;
    use std::time::Duration;

    fn record(id: &str, service: &str, endpoint: &str) -> ServiceRecord {
        ServiceRecord::new(id, service, endpoint, Utc::now(), 5000)
    }

    fn populated() -> DiscoveryStore {
        let mut store = DiscoveryStore::new();
        store.set("a", record("a", "api", "http://h1:3000").with_balancer("http://lb1"));
        store.set("b", record("b", "api", "http://h2:3000"));
        store.set("c", record("c", "web", "http://h3:8080").with_balancer("http://lb2"));
        store
    }

    #[test]
    fn test_set_and_lookup() {
        let store = populated();

        assert_eq!(store.len(), 3);
        assert_eq!(store.get("a").unwrap().endpoint, "http://h1:3000");
        assert_eq!(store.by_service("api").len(), 2);
        assert_eq!(
            store.by_endpoint_hash(&hash_endpoint("http://h2:3000")).unwrap().id,
            "b"
        );
        assert_eq!(store.by_balancer("http://lb2").unwrap().id, "c");
        assert!(store.by_balancer("http://lb3").is_none());
        assert!(store.by_endpoint_hash("deadbeef").is_none());
    }

    #[test]
    fn test_remove_purges_every_index() {
        let mut store = populated();

        let removed = store.remove("a").unwrap();
        assert_eq!(removed.id, "a");
        assert!(store.get("a").is_none());
        assert!(store.by_endpoint_hash(&hash_endpoint("http://h1:3000")).is_none());
        assert!(store.by_balancer("http://lb1").is_none());
        assert_eq!(store.by_service("api").len(), 1);

        assert!(store.remove("a").is_none());
    }

    #[test]
    fn test_set_replaces_stale_index_entries() {
        let mut store = populated();

        // Same id re-registered without a balancer
        store.set("a", record("a", "api", "http://h1:3000"));
        assert!(store.by_balancer("http://lb1").is_none());
        assert_eq!(store.by_service("api").len(), 2);

        // Same id moved to another service
        store.set("a", record("a", "jobs", "http://h1:3000"));
        assert_eq!(store.by_service("api").len(), 1);
        assert_eq!(store.by_service("jobs").len(), 1);
    }

    #[test]
    fn test_shared_endpoint_index_survives_removal() {
        let mut store = DiscoveryStore::new();
        store.set("a", record("a", "api", "http://h1:3000"));
        store.set("b", record("b", "web", "http://h1:3000"));

        store.remove("b");
        let hash = hash_endpoint("http://h1:3000");
        assert_eq!(store.by_endpoint_hash(&hash).unwrap().id, "a");
    }

    #[test]
    fn test_evict_unhealthy() {
        let mut store = populated();
        let now = Utc::now();
        let mut stale = record("d", "api", "http://h4:3000");
        stale.timestamp = now - TimeDelta::seconds(60);
        store.set("d", stale);

        let evicted = store.evict_unhealthy(&HealthEvaluator::new(Duration::from_secs(15)), now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "d");
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_get_random() {
        let store = populated();

        for _ in 0..50 {
            let picked = store.get_random(Some("api")).unwrap();
            assert_eq!(picked.service_name, "api");
        }
        assert!(store.get_random(None).is_some());
        assert!(store.get_random(Some("missing")).is_none());
        assert!(DiscoveryStore::new().get_random(None).is_none());
    }

    #[test]
    fn test_weighted_full_weight_is_deterministic() {
        let mut store = DiscoveryStore::new();
        for i in 0..8 {
            let id = format!("id{i}");
            store.set(&id, record(&id, "api", &format!("http://h{i}:3000")));
        }
        let caller = hash_endpoint("http://caller:3000");

        let first = store.get_random_weighted("api", &caller, 1.0).unwrap().id.clone();
        for _ in 0..100 {
            assert_eq!(store.get_random_weighted("api", &caller, 1.0).unwrap().id, first);
        }

        // Weights above 1 clamp
        assert_eq!(store.get_random_weighted("api", &caller, 3.0).unwrap().id, first);
    }

    #[test]
    fn test_weighted_prefers_own_endpoint() {
        let mut store = DiscoveryStore::new();
        for i in 0..4 {
            let id = format!("id{i}");
            store.set(&id, record(&id, "api", &format!("http://h{i}:3000")));
        }

        let own = hash_endpoint("http://h2:3000");
        assert_eq!(store.get_random_weighted("api", &own, 1.0).unwrap().id, "id2");
    }

    #[test]
    fn test_weighted_zero_weight_is_uniform() {
        let mut store = DiscoveryStore::new();
        for i in 0..4 {
            let id = format!("id{i}");
            store.set(&id, record(&id, "api", &format!("http://h{i}:3000")));
        }
        let caller = hash_endpoint("http://caller:3000");

        let trials = 8000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..trials {
            let picked = store.get_random_weighted("api", &caller, 0.0).unwrap();
            *counts.entry(picked.id.clone()).or_default() += 1;
        }

        // Expected 2000 each; a 25% band is far outside sampling noise
        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!((1500..=2500).contains(count), "skewed distribution: {counts:?}");
        }
    }

    #[test]
    fn test_weighted_half_weight_interpolates() {
        let mut store = DiscoveryStore::new();
        for i in 0..4 {
            let id = format!("id{i}");
            store.set(&id, record(&id, "api", &format!("http://h{i}:3000")));
        }
        let caller = hash_endpoint("http://caller:3000");
        let sticky = store.get_random_weighted("api", &caller, 1.0).unwrap().id.clone();

        let trials = 8000;
        let hits = (0..trials)
            .filter(|_| store.get_random_weighted("api", &caller, 0.5).unwrap().id == sticky)
            .count();

        // P = 0.5 + 0.5 / 4 = 0.625, expected 5000
        assert!((4500..=5500).contains(&hits), "sticky hits: {hits}");
    }

    #[test]
    fn test_weighted_negative_weight_disables_weighting() {
        let store = populated();
        let caller = hash_endpoint("http://caller:3000");

        for _ in 0..20 {
            let picked = store.get_random_weighted("api", &caller, -1.0).unwrap();
            assert_eq!(picked.service_name, "api");
        }
        assert!(store.get_random_weighted("api", &caller, f64::NAN).is_some());
        assert!(store.get_random_weighted("missing", &caller, 1.0).is_none());
    }
}
