//! Polling watcher keeping one local store in step with the backend
//!
//! Each cycle queries the backend, drops records that are no longer healthy,
//! diffs the result against the previous cycle and publishes the difference
//! to the change callbacks. A failed cycle leaves the store untouched and the
//! loop carries on at the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::callbacks::CallbackRegistry;
use super::health::HealthEvaluator;
use super::record::{ChangeEvent, ServiceRecord, StoreKind};
use super::store::SharedStore;
use crate::backend::{DiscoveryBackend, QueryOptions, RecordFilter};
use crate::clock::Clock;
use crate::error::Result;

pub struct Watcher {
    kind: StoreKind,
    backend: Arc<dyn DiscoveryBackend>,
    store: SharedStore,
    callbacks: CallbackRegistry,
    clock: Arc<dyn Clock>,
    health: HealthEvaluator,
    query_limit: usize,
    /// Healthy records seen by the last successful cycle. Also serializes
    /// cycles between the background loop and forced syncs.
    known: Mutex<HashMap<String, ServiceRecord>>,
}

impl Watcher {
    #[must_use]
    pub fn new(
        kind: StoreKind,
        backend: Arc<dyn DiscoveryBackend>,
        store: SharedStore,
        callbacks: CallbackRegistry,
        clock: Arc<dyn Clock>,
        health: HealthEvaluator,
        query_limit: usize,
    ) -> Self {
        Self {
            kind,
            backend,
            store,
            callbacks,
            clock,
            health,
            query_limit,
            known: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    const fn filter(&self) -> RecordFilter {
        match self.kind {
            StoreKind::Endpoints => RecordFilter::All,
            StoreKind::Balancers => RecordFilter::WithBalancer,
        }
    }

    /// Run one sync cycle.
    ///
    /// Returns the change that was published, or `None` when nothing joined
    /// or left. Backend errors are returned with the store left as it was.
    pub async fn run_cycle(&self) -> Result<Option<ChangeEvent>> {
        let mut known = self.known.lock().await;

        let fetched = self
            .backend
            .query(
                self.filter(),
                QueryOptions {
                    newest_first: true,
                    limit: self.query_limit,
                },
            )
            .await?;

        let now = self.clock.now();
        let mut seen = HashSet::new();
        let current: Vec<ServiceRecord> = fetched
            .into_iter()
            .filter(|record| self.health.is_healthy(record, now))
            .filter(|record| seen.insert(record.id.clone()))
            .collect();

        let added: Vec<ServiceRecord> = current
            .iter()
            .filter(|record| !known.contains_key(&record.id))
            .cloned()
            .collect();
        let mut removed: Vec<ServiceRecord> = known
            .values()
            .filter(|record| !seen.contains(&record.id))
            .cloned()
            .collect();
        removed.sort_by(|a, b| a.id.cmp(&b.id));

        let evicted = {
            let mut store = self.store.write();
            for record in &removed {
                store.remove(&record.id);
            }
            for record in &current {
                store.set(&record.id, record.clone());
            }
            store.evict_unhealthy(&self.health, self.clock.now())
        };

        for record in &evicted {
            tracing::debug!(store = %self.kind, id = %record.id, endpoint = %record.endpoint, "Evicted stale record");
        }
        for record in &added {
            tracing::info!(
                store = %self.kind,
                service = %record.service_name,
                endpoint = %record.endpoint,
                "Instance joined"
            );
        }
        for record in &removed {
            tracing::info!(
                store = %self.kind,
                service = %record.service_name,
                endpoint = %record.endpoint,
                "Instance left"
            );
        }

        *known = current
            .iter()
            .map(|record| (record.id.clone(), record.clone()))
            .collect();

        if added.is_empty() && removed.is_empty() {
            return Ok(None);
        }

        let event = ChangeEvent {
            store_kind: self.kind,
            removed,
            added,
            all: current,
        };
        self.callbacks.dispatch(&event);

        Ok(Some(event))
    }

    /// Start the polling loop: one cycle `poll_interval` after the previous
    /// one completes, until `cancel_token` fires. The caller runs the first
    /// cycle itself. Cancellation only interrupts the sleep, so a cycle already
    /// running completes and dispatches its change.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!(store = %self.kind, backend = self.backend.name(), "Watch loop started");

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    () = tokio::time::sleep(poll_interval) => {}
                }

                if let Err(e) = self.run_cycle().await {
                    tracing::warn!(store = %self.kind, error = %e, "Discovery sync failed, retrying next tick");
                }
            }

            tracing::debug!(store = %self.kind, "Watch loop stopped");
        })
    }
}
