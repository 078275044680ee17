//! Heartbeat publishing for this instance
//!
//! The first heartbeat carries the full record (identity hash and balancer),
//! later ones only refresh the timestamp and ping interval. All of them are
//! idempotent upserts keyed by `(service_name, endpoint)`.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::hasher::hash_endpoint;
use super::record::{HeartbeatPayload, RecordIdentity, RecordKey};
use crate::backend::DiscoveryBackend;
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Default heartbeat period
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(5000);

/// What this instance publishes about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub service_name: String,
    pub endpoint: Option<String>,
    pub balancer: Option<String>,
    pub ping_interval: Duration,
}

impl Registration {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: None,
            balancer: None,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn balancer(mut self, balancer: impl Into<String>) -> Self {
        self.balancer = Some(balancer.into());
        self
    }

    #[must_use]
    pub const fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// The address actually published: the endpoint, or the balancer when no
    /// endpoint is given
    #[must_use]
    pub fn resolved_endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().or(self.balancer.as_deref())
    }

    fn validate(&self) -> Result<String> {
        if self.service_name.trim().is_empty() {
            return Err(Error::Configuration("service name must not be empty".to_string()));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::Configuration(
                "ping interval must be greater than zero".to_string(),
            ));
        }
        self.resolved_endpoint().map(str::to_string).ok_or_else(|| {
            Error::Configuration(format!(
                "no endpoint url for service '{}', cannot register with the cluster",
                self.service_name
            ))
        })
    }
}

/// Running heartbeat task for one registration
pub struct HeartbeatPublisher {
    key: RecordKey,
    endpoint_hash: String,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatPublisher {
    /// Validate the registration, write the full heartbeat and start the
    /// recurring task.
    ///
    /// Errors from the first heartbeat are returned and no task is started.
    pub async fn start(
        backend: Arc<dyn DiscoveryBackend>,
        registration: &Registration,
        clock: Arc<dyn Clock>,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let endpoint = registration.validate()?;
        let endpoint_hash = hash_endpoint(&endpoint);
        let key = RecordKey::new(registration.service_name.clone(), endpoint);
        let ping_interval_ms = u64::try_from(registration.ping_interval.as_millis()).unwrap_or(u64::MAX);

        let identity = RecordIdentity {
            endpoint_hash: endpoint_hash.clone(),
            balancer: registration.balancer.clone(),
        };
        backend
            .upsert(&key, &HeartbeatPayload::full(clock.now(), ping_interval_ms, identity))
            .await?;

        let handle = tokio::spawn(Self::run(
            backend,
            key.clone(),
            ping_interval_ms,
            registration.ping_interval,
            clock,
            cancel_token.clone(),
        ));

        Ok(Self {
            key,
            endpoint_hash,
            cancel_token,
            handle: Some(handle),
        })
    }

    async fn run(
        backend: Arc<dyn DiscoveryBackend>,
        key: RecordKey,
        ping_interval_ms: u64,
        period: Duration,
        clock: Arc<dyn Clock>,
        cancel_token: CancellationToken,
    ) {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    tracing::debug!(record = %key, "Heartbeat task stopped");
                    return;
                }
                _ = timer.tick() => {
                    let payload = HeartbeatPayload::partial(clock.now(), ping_interval_ms);
                    if let Err(e) = backend.upsert(&key, &payload).await {
                        tracing::warn!(record = %key, error = %e, "Heartbeat failed, retrying next tick");
                    }
                }
            }
        }
    }

    #[must_use]
    pub const fn key(&self) -> &RecordKey {
        &self.key
    }

    #[must_use]
    pub fn endpoint_hash(&self) -> &str {
        &self.endpoint_hash
    }

    /// Stop the recurring task and wait for it. Calling it again does nothing.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel_token.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(record = %self.key, error = %e, "Heartbeat task ended abnormally");
        }
    }
}

impl Drop for HeartbeatPublisher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
