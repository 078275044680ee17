//! Error types for the discovery engine

use thiserror::Error;

/// Discovery error types
///
/// Lookups that find nothing are not errors; they return `None` or an empty list.
#[derive(Debug, Error)]
pub enum Error {
    /// Misuse or misconfiguration. Raised synchronously and never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single backend call failed or timed out
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, Error>;

