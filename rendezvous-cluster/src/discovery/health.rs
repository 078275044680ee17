//! Staleness evaluation for service records
//!
//! A record stays healthy while its last heartbeat is younger than its declared
//! ping interval plus a fixed padding. The padding absorbs the watch loop's
//! polling granularity.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::record::ServiceRecord;

/// Default allowance on top of a record's ping interval
pub const DEFAULT_HEALTH_PADDING: Duration = Duration::from_millis(15_000);

/// Returns true when `now - record.timestamp < ping_interval + padding`
#[must_use]
pub fn is_healthy(record: &ServiceRecord, now: DateTime<Utc>, padding: Duration) -> bool {
    let elapsed_ms = now.signed_duration_since(record.timestamp).num_milliseconds();
    let allowance_ms = record
        .ping_interval_ms
        .saturating_add(u64::try_from(padding.as_millis()).unwrap_or(u64::MAX));

    // Negative elapsed time (writer clock ahead of ours) counts as fresh
    match u64::try_from(elapsed_ms) {
        Ok(elapsed) => elapsed < allowance_ms,
        Err(_) => true,
    }
}

/// Health predicate with a fixed padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEvaluator {
    padding: Duration,
}

impl HealthEvaluator {
    #[must_use]
    pub const fn new(padding: Duration) -> Self {
        Self { padding }
    }

    #[must_use]
    pub const fn padding(&self) -> Duration {
        self.padding
    }

    #[must_use]
    pub fn is_healthy(&self, record: &ServiceRecord, now: DateTime<Utc>) -> bool {
        is_healthy(record, now, self.padding)
    }
}

impl Default for HealthEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_PADDING)
    }
}
