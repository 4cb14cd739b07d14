//! Cache configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, Result};

/// Default channel for cross-instance invalidation events.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "heytom:cache:invalidation";

/// Configuration for the hybrid cache.
///
/// All fields have defaults so that `CacheConfig::default()` yields a
/// working near-enabled configuration; only `far_url` is
/// deployment-specific. Durations deserialize from integer seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Far-tier connection string (transport-specific address).
    pub far_url: String,

    /// Whether the in-process near tier is enabled. When disabled, all
    /// near-tier paths, including the invalidation subscription, are
    /// skipped.
    pub near_enabled: bool,

    /// Maximum number of entries held by the near tier.
    pub near_max_size: usize,

    /// Expiration applied to near-tier entries that carry no explicit
    /// policy, and to entries populated by far-tier read-through.
    #[serde(with = "duration_secs")]
    pub near_default_ttl: Duration,

    /// Per-operation far-tier timeout.
    #[serde(with = "duration_secs")]
    pub far_timeout: Duration,

    /// Whether hit/miss counters and the duration histogram are recorded.
    pub metrics_enabled: bool,

    /// Whether invalidation events are published and consumed. Requires
    /// the near tier to be enabled to have any effect.
    pub invalidation_enabled: bool,

    /// Channel (topic) name for invalidation fan-out.
    pub invalidation_channel: String,

    /// Identifier stamped into the `Source` field of published
    /// invalidation events. Defaults to the `HOSTNAME` environment
    /// variable when present.
    pub instance_name: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            far_url: "redis://127.0.0.1:6379".to_string(),
            near_enabled: true,
            near_max_size: 1000,
            near_default_ttl: Duration::from_secs(300),
            far_timeout: Duration::from_secs(5),
            metrics_enabled: true,
            invalidation_enabled: true,
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_string(),
            instance_name: std::env::var("HOSTNAME").ok(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration for the given far-tier address with all
    /// other fields at their defaults.
    #[must_use]
    pub fn for_url(far_url: impl Into<String>) -> Self {
        Self {
            far_url: far_url.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when a bound is zero, a
    /// duration is zero, or the invalidation channel is empty while
    /// invalidation is enabled.
    pub fn validate(&self) -> Result<()> {
        if self.far_url.trim().is_empty() {
            return Err(CacheError::configuration("far_url must not be empty"));
        }
        if self.near_enabled && self.near_max_size == 0 {
            return Err(CacheError::configuration(
                "near_max_size must be at least 1 when the near tier is enabled",
            ));
        }
        if self.near_default_ttl.is_zero() {
            return Err(CacheError::configuration(
                "near_default_ttl must be greater than zero",
            ));
        }
        if self.far_timeout.is_zero() {
            return Err(CacheError::configuration(
                "far_timeout must be greater than zero",
            ));
        }
        if self.invalidation_enabled && self.invalidation_channel.trim().is_empty() {
            return Err(CacheError::configuration(
                "invalidation_channel must not be empty when invalidation is enabled",
            ));
        }
        Ok(())
    }

    /// Whether the invalidation subscription should be installed: both the
    /// near tier and invalidation must be enabled.
    #[must_use]
    pub fn invalidation_active(&self) -> bool {
        self.near_enabled && self.invalidation_enabled
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
