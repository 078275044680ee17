pub mod config;
pub mod logging;

pub use config::{Config, DiscoveryConfig, LoggingConfig, ServiceConfig};
