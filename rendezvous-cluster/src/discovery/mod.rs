//! Service discovery: heartbeats out, watched peer views in
//!
//! [`DiscoveryEngine`] ties the parts together. The other modules are usable
//! on their own for custom compositions and tests.

pub mod callbacks;
pub mod engine;
pub mod hasher;
pub mod health;
pub mod heartbeat;
pub mod record;
pub mod selector;
pub mod store;
pub mod watcher;

pub use callbacks::{CallbackRegistry, ChangeCallback};
pub use engine::{DiscoveryEngine, DiscoveryOptions};
pub use hasher::{hash_distance, hash_endpoint};
pub use health::{is_healthy, HealthEvaluator, DEFAULT_HEALTH_PADDING};
pub use heartbeat::{HeartbeatPublisher, Registration, DEFAULT_PING_INTERVAL};
pub use record::{ChangeEvent, HeartbeatPayload, RecordIdentity, RecordKey, ServiceRecord, StoreKind};
pub use selector::Selector;
pub use store::{DiscoveryStore, SharedStore};
pub use watcher::Watcher;
