use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

/// Where and how peers are discovered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Backend URL; the scheme selects the backend (`redis://`, `memory://`)
    pub url: String,
    /// Prefix for every key the backend writes
    pub key_prefix: String,
    pub poll_interval_ms: u64,
    /// Allowance added to a peer's declared ping interval before it counts as stale
    pub health_padding_ms: u64,
    /// Maximum number of records read per watch cycle
    pub query_limit: usize,
    /// Bias in [0, 1] toward the peer closest to this instance's own hash.
    /// Unset disables sticky picking.
    pub self_weight: Option<f64>,
    pub operation_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: "memory://local".to_string(),
            key_prefix: "rendezvous:".to_string(),
            poll_interval_ms: 5000,
            health_padding_ms: 15000,
            query_limit: 100,
            self_weight: None,
            operation_timeout_ms: 5000,
        }
    }
}

/// This instance's own registration. Leave `name` unset to run as a pure consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub balancer: Option<String>,
    pub ping_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: None,
            endpoint: None,
            balancer: None,
            ping_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RENDEZVOUS_DISCOVERY__POLL_INTERVAL_MS, RENDEZVOUS_SERVICE__NAME, ...
        builder = builder.add_source(
            Environment::with_prefix("RENDEZVOUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration for values that would make the engine misbehave.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.discovery.url.trim().is_empty() {
            errors.push("discovery.url must not be empty".to_string());
        }
        if self.discovery.poll_interval_ms == 0 {
            errors.push("discovery.poll_interval_ms must be greater than 0".to_string());
        }
        if self.discovery.query_limit == 0 {
            errors.push("discovery.query_limit must be greater than 0".to_string());
        }
        if self.discovery.operation_timeout_ms == 0 {
            errors.push("discovery.operation_timeout_ms must be greater than 0".to_string());
        }
        if let Some(weight) = self.discovery.self_weight {
            if weight > 1.0 {
                errors.push(format!("discovery.self_weight must be at most 1.0, got {weight}"));
            }
        }

        if let Some(name) = &self.service.name {
            if name.trim().is_empty() {
                errors.push("service.name must not be empty when set".to_string());
            }
            if self.service.endpoint.is_none() && self.service.balancer.is_none() {
                errors.push(format!(
                    "service '{name}' needs service.endpoint or service.balancer"
                ));
            }
            if self.service.ping_interval_ms == 0 {
                errors.push("service.ping_interval_ms must be greater than 0".to_string());
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `RENDEZVOUS_CONFIG_PATH` environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("RENDEZVOUS_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!(url = %config.discovery.url, "Configuration loaded and validated");

    Ok(config)
}
