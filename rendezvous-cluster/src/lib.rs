pub mod backend;
pub mod clock;
pub mod discovery;
pub mod error;

pub use backend::{DiscoveryBackend, MemoryBackend, RedisBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use discovery::{
    hash_endpoint, ChangeCallback, ChangeEvent, DiscoveryEngine, DiscoveryOptions,
    DiscoveryStore, HealthEvaluator, Registration, ServiceRecord, StoreKind,
};
pub use error::{Error, Result};
