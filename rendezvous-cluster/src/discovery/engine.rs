//! Discovery engine
//!
//! One engine owns a backend connection, the heartbeat for this instance, a
//! watcher per store kind and the selector over those stores. It is an
//! explicit value held by the application; nothing here is global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rendezvous_core::DiscoveryConfig;

use super::callbacks::{CallbackRegistry, ChangeCallback};
use super::health::{HealthEvaluator, DEFAULT_HEALTH_PADDING};
use super::heartbeat::{HeartbeatPublisher, Registration};
use super::record::{ChangeEvent, ServiceRecord, StoreKind};
use super::selector::Selector;
use super::store::{DiscoveryStore, SharedStore};
use super::watcher::Watcher;
use crate::backend::{self, BackendOptions, DiscoveryBackend};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Pause between the end of one watch cycle and the start of the next
    pub poll_interval: Duration,
    /// Allowance added to a record's declared ping interval
    pub health_padding: Duration,
    /// Most records read per watch cycle
    pub query_limit: usize,
    /// Stickiness of endpoint picks toward this instance, `None` for uniform
    pub self_weight: Option<f64>,
    pub key_prefix: String,
    pub operation_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            health_padding: DEFAULT_HEALTH_PADDING,
            query_limit: 100,
            self_weight: None,
            key_prefix: "rendezvous:".to_string(),
            operation_timeout: Duration::from_millis(5000),
        }
    }
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            health_padding: Duration::from_millis(config.health_padding_ms),
            query_limit: config.query_limit,
            self_weight: config.self_weight,
            key_prefix: config.key_prefix.clone(),
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        }
    }
}

impl DiscoveryOptions {
    fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            key_prefix: self.key_prefix.clone(),
            operation_timeout: self.operation_timeout,
        }
    }
}

/// Everything that lives for one connection
struct Session {
    backend: Arc<dyn DiscoveryBackend>,
    watchers: Vec<Arc<Watcher>>,
    tasks: Vec<JoinHandle<()>>,
    heartbeat: Option<HeartbeatPublisher>,
    cancel_token: CancellationToken,
}

enum Lifecycle {
    Disconnected,
    Connected(Session),
}

pub struct DiscoveryEngine {
    options: DiscoveryOptions,
    clock: Arc<dyn Clock>,
    endpoints: SharedStore,
    balancers: SharedStore,
    selector: Selector,
    callbacks: CallbackRegistry,
    lifecycle: Mutex<Lifecycle>,
    connected: AtomicBool,
    registered: AtomicBool,
}

impl DiscoveryEngine {
    #[must_use]
    pub fn new(options: DiscoveryOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(options: DiscoveryOptions, clock: Arc<dyn Clock>) -> Self {
        let endpoints = DiscoveryStore::shared();
        let balancers = DiscoveryStore::shared();
        let selector = Selector::new(endpoints.clone(), balancers.clone(), options.self_weight);

        Self {
            options,
            clock,
            endpoints,
            balancers,
            selector,
            callbacks: CallbackRegistry::new(),
            lifecycle: Mutex::new(Lifecycle::Disconnected),
            connected: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Connect to the backend named by `url` and start watching
    pub async fn connect(&self, url: &str) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Connected(_)) {
            return Err(Error::Configuration("discovery engine is already connected".to_string()));
        }

        let backend = backend::connect(url, &self.options.backend_options()).await?;
        *lifecycle = Lifecycle::Connected(self.start_session(backend).await);
        Ok(())
    }

    /// Like [`Self::connect`], with a backend built by the caller
    pub async fn connect_with_backend(&self, backend: Arc<dyn DiscoveryBackend>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Connected(_)) {
            return Err(Error::Configuration("discovery engine is already connected".to_string()));
        }

        *lifecycle = Lifecycle::Connected(self.start_session(backend).await);
        Ok(())
    }

    /// Load the initial view of both stores, then start the watch loops
    async fn start_session(&self, backend: Arc<dyn DiscoveryBackend>) -> Session {
        let cancel_token = CancellationToken::new();
        let health = HealthEvaluator::new(self.options.health_padding);

        let mut watchers = Vec::with_capacity(2);
        let mut tasks = Vec::with_capacity(2);
        for (kind, store) in [
            (StoreKind::Endpoints, &self.endpoints),
            (StoreKind::Balancers, &self.balancers),
        ] {
            let watcher = Arc::new(Watcher::new(
                kind,
                backend.clone(),
                store.clone(),
                self.callbacks.clone(),
                self.clock.clone(),
                health,
                self.options.query_limit,
            ));

            if let Err(e) = watcher.run_cycle().await {
                tracing::warn!(store = %kind, error = %e, "Initial discovery sync failed, the watch loop will retry");
            }

            tasks.push(watcher.clone().spawn(self.options.poll_interval, cancel_token.child_token()));
            watchers.push(watcher);
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            backend = backend.name(),
            poll_interval = ?self.options.poll_interval,
            "Connected to discovery backend"
        );

        Session {
            backend,
            watchers,
            tasks,
            heartbeat: None,
            cancel_token,
        }
    }

    /// Publish this instance and keep its heartbeat going until disconnect
    pub async fn register(&self, registration: Registration) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Connected(session) = &mut *lifecycle else {
            return Err(Error::Configuration(
                "discovery engine must be connected before registering".to_string(),
            ));
        };
        if session.heartbeat.is_some() {
            return Err(Error::Configuration("this instance is already registered".to_string()));
        }

        let publisher = HeartbeatPublisher::start(
            session.backend.clone(),
            &registration,
            self.clock.clone(),
            session.cancel_token.child_token(),
        )
        .await?;

        self.selector
            .set_self_hash(Some(publisher.endpoint_hash().to_string()));
        tracing::info!(
            service = %publisher.key().service_name,
            endpoint = %publisher.key().endpoint,
            balancer = registration.balancer.as_deref().unwrap_or("none"),
            ping_interval = ?registration.ping_interval,
            "Registered with discovery backend"
        );

        session.heartbeat = Some(publisher);
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop every task, release the backend and forget the session.
    ///
    /// Calling it while disconnected does nothing. The session state is reset
    /// even when releasing the backend fails; that error is still returned.
    pub async fn disconnect(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Connected(mut session) =
            std::mem::replace(&mut *lifecycle, Lifecycle::Disconnected)
        else {
            return Ok(());
        };

        if let Some(mut heartbeat) = session.heartbeat.take() {
            heartbeat.stop().await;
        }

        session.cancel_token.cancel();
        for result in futures::future::join_all(session.tasks.drain(..)).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Watch task ended abnormally");
            }
        }

        let released = session.backend.disconnect().await;

        *self.endpoints.write() = DiscoveryStore::new();
        *self.balancers.write() = DiscoveryStore::new();
        self.selector.set_self_hash(None);
        self.registered.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);

        tracing::info!(backend = session.backend.name(), "Disconnected from discovery backend");
        released
    }

    /// Run one watch cycle per store kind now, returning the changes seen
    pub async fn sync_now(&self) -> Result<Vec<ChangeEvent>> {
        // Held for the whole sync so a concurrent disconnect cannot be undone
        let lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Connected(session) = &*lifecycle else {
            return Err(Error::Configuration("discovery engine is not connected".to_string()));
        };

        let mut events = Vec::new();
        for watcher in &session.watchers {
            if let Some(event) = watcher.run_cycle().await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Replace every change callback
    pub fn set_change_callbacks(&self, callbacks: Vec<ChangeCallback>) {
        self.callbacks.set(callbacks);
    }

    pub fn add_change_callback(&self, callback: ChangeCallback) {
        self.callbacks.add(callback);
    }

    #[must_use]
    pub fn pick_endpoint(&self, service_name: &str) -> Option<String> {
        self.selector.pick_endpoint(service_name)
    }

    #[must_use]
    pub fn pick_endpoint_hash(&self, service_name: &str) -> Option<String> {
        self.selector.pick_endpoint_hash(service_name)
    }

    #[must_use]
    pub fn pick_balancer(&self, endpoint_hash: Option<&str>) -> Option<String> {
        self.selector.pick_balancer(endpoint_hash)
    }

    #[must_use]
    pub fn hash_to_endpoint(&self, hash: &str) -> Option<String> {
        self.selector.hash_to_endpoint(hash)
    }

    #[must_use]
    pub fn endpoint_to_hash(&self, endpoint: &str) -> String {
        Selector::endpoint_to_hash(endpoint)
    }

    #[must_use]
    pub fn has_balancer(&self, balancer: &str) -> bool {
        self.selector.has_balancer(balancer)
    }

    #[must_use]
    pub fn all_endpoints(&self) -> Vec<ServiceRecord> {
        self.selector.all_endpoints()
    }

    #[must_use]
    pub fn all_balancers(&self) -> Vec<ServiceRecord> {
        self.selector.all_balancers()
    }

    /// Endpoint hash of this instance while registered
    #[must_use]
    pub fn self_endpoint_hash(&self) -> Option<String> {
        self.selector.self_hash()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        if let Lifecycle::Connected(session) = self.lifecycle.get_mut() {
            session.cancel_token.cancel();
        }
    }
}
