//! Configuration for the tollgate core
//!
//! Tunables for reconciliation, caching, retry and the actor flush loop.
//! Loaded from a TOML file when one is provided, otherwise defaults
//! carry the production constants.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Core configuration shared by the service, reconciler, cache and actor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// How far behind `now` analytics is assumed settled, in milliseconds
    pub watermark_delay_ms: i64,

    /// Drift below this magnitude is noise and is not applied
    pub drift_epsilon: f64,

    /// Drift above this magnitude is rejected and escalated
    pub max_drift: i64,

    /// Attempts for cache and DB read paths (includes the first try)
    pub retry_attempts: usize,

    /// Base delay for retry back-off, in milliseconds
    pub retry_base_delay_ms: u64,

    /// Fresh TTL for the `customerEntitlement` namespace, in seconds
    pub entitlement_ttl_secs: u64,

    /// Extra stale-while-revalidate window on top of the fresh TTL, in seconds
    pub entitlement_swr_secs: u64,

    /// TTL for the `negativeEntitlements` namespace, in seconds
    pub negative_ttl_secs: u64,

    /// TTL for the `accessControlList` and `getCurrentUsage` namespaces, in seconds
    pub summary_ttl_secs: u64,

    /// How long a computed entitlement stays valid before revalidation, in milliseconds
    pub revalidate_interval_ms: i64,

    /// Default alarm period for the actor flush loop, in seconds
    pub flush_interval_secs: u64,

    /// Usage threshold (percent of limit) that flips `over_threshold`
    pub notify_usage_threshold: u8,

    /// Hot-tier cache capacity per namespace
    pub hot_cache_capacity: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            watermark_delay_ms: 5 * 60 * 1000,
            drift_epsilon: 0.001,
            max_drift: 1000,
            retry_attempts: 3,
            retry_base_delay_ms: 50,
            entitlement_ttl_secs: 60,
            entitlement_swr_secs: 120,
            negative_ttl_secs: 60,
            summary_ttl_secs: 30,
            revalidate_interval_ms: 60 * 1000,
            flush_interval_secs: 60,
            notify_usage_threshold: 95,
            hot_cache_capacity: 1024,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the rest of the core relies on
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a bound is violated
    pub fn validate(&self) -> Result<()> {
        if self.retry_attempts == 0 {
            return Err(Error::Config("retry_attempts must be > 0".into()));
        }
        if self.max_drift <= 0 {
            return Err(Error::Config("max_drift must be positive".into()));
        }
        if self.watermark_delay_ms <= 0 {
            return Err(Error::Config("watermark_delay_ms must be positive".into()));
        }
        if self.notify_usage_threshold == 0 || self.notify_usage_threshold > 100 {
            return Err(Error::Config(
                "notify_usage_threshold must be within 1..=100".into(),
            ));
        }
        Ok(())
    }

    /// Alarm period for the actor flush loop: `min(30m, max(5s, flush ?? ttl))`
    #[must_use]
    pub fn alarm_period(&self, flush_time: Option<Duration>) -> Duration {
        let requested = flush_time.unwrap_or(Duration::from_secs(self.flush_interval_secs));
        requested.clamp(Duration::from_secs(5), Duration::from_secs(30 * 60))
    }
}
