//! Peer selection over the local stores
//!
//! Every pick is a short read lock on a store and never touches the backend.

use parking_lot::RwLock;

use super::hasher::hash_endpoint;
use super::record::ServiceRecord;
use super::store::SharedStore;

#[derive(Debug)]
pub struct Selector {
    endpoints: SharedStore,
    balancers: SharedStore,
    self_weight: Option<f64>,
    /// Endpoint hash of this instance, set while registered
    self_hash: RwLock<Option<String>>,
}

impl Selector {
    #[must_use]
    pub fn new(endpoints: SharedStore, balancers: SharedStore, self_weight: Option<f64>) -> Self {
        Self {
            endpoints,
            balancers,
            self_weight,
            self_hash: RwLock::new(None),
        }
    }

    pub fn set_self_hash(&self, hash: Option<String>) {
        *self.self_hash.write() = hash;
    }

    #[must_use]
    pub fn self_hash(&self) -> Option<String> {
        self.self_hash.read().clone()
    }

    fn pick(&self, service_name: &str) -> Option<ServiceRecord> {
        let store = self.endpoints.read();
        let self_hash = self.self_hash.read();

        let picked = match (self.self_weight, self_hash.as_deref()) {
            (Some(weight), Some(hash)) => store.get_random_weighted(service_name, hash, weight),
            _ => store.get_random(Some(service_name)),
        };
        picked.cloned()
    }

    /// Endpoint of a live instance of `service_name`
    ///
    /// Sticky toward this instance's own hash when a self weight is configured
    /// and this engine is registered, uniform otherwise.
    #[must_use]
    pub fn pick_endpoint(&self, service_name: &str) -> Option<String> {
        self.pick(service_name).map(|record| record.endpoint)
    }

    /// Same selection as [`Self::pick_endpoint`], returning the endpoint hash
    #[must_use]
    pub fn pick_endpoint_hash(&self, service_name: &str) -> Option<String> {
        self.pick(service_name).map(|record| record.endpoint_hash)
    }

    /// Balancer for a request, preferring the balancer fronting `endpoint_hash`
    #[must_use]
    pub fn pick_balancer(&self, endpoint_hash: Option<&str>) -> Option<String> {
        if let Some(hash) = endpoint_hash {
            let affine = self
                .endpoints
                .read()
                .by_endpoint_hash(hash)
                .and_then(|record| record.balancer.clone());
            if affine.is_some() {
                return affine;
            }
        }

        self.balancers
            .read()
            .get_random(None)
            .and_then(|record| record.balancer.clone())
    }

    #[must_use]
    pub fn hash_to_endpoint(&self, hash: &str) -> Option<String> {
        self.endpoints
            .read()
            .by_endpoint_hash(hash)
            .map(|record| record.endpoint.clone())
    }

    #[must_use]
    pub fn endpoint_to_hash(endpoint: &str) -> String {
        hash_endpoint(endpoint)
    }

    #[must_use]
    pub fn has_balancer(&self, balancer: &str) -> bool {
        self.balancers.read().by_balancer(balancer).is_some()
    }

    /// Live endpoint records, ordered by service then endpoint
    #[must_use]
    pub fn all_endpoints(&self) -> Vec<ServiceRecord> {
        sorted(self.endpoints.read().get_all())
    }

    #[must_use]
    pub fn all_balancers(&self) -> Vec<ServiceRecord> {
        sorted(self.balancers.read().get_all())
    }
}

fn sorted(mut records: Vec<ServiceRecord>) -> Vec<ServiceRecord> {
    records.sort_by(|a, b| {
        a.service_name
            .cmp(&b.service_name)
            .then_with(|| a.endpoint.cmp(&b.endpoint))
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}
