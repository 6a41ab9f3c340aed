//! Controller configuration.
//!
//! Precedence, lowest first: defaults, TOML file, `CONVERGE_*` environment
//! variables, then whatever the caller sets explicitly.

use std::path::Path;
use std::time::Duration;

use converge_core::{Error, ObjectKey, Result};
use converge_workqueue::{MaxOfLimiter, controller_limiter};
use serde::{Deserialize, Serialize};

use converge_cache::InformerConfig;

/// Configuration for a [`crate::Controller`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// How long to wait for the initial cache listing before giving up.
    #[serde(with = "duration_ms", rename = "cache_sync_timeout_ms")]
    pub cache_sync_timeout: Duration,

    /// Full re-delivery of the cache; zero disables.
    #[serde(with = "duration_ms", rename = "resync_period_ms")]
    pub resync_period: Duration,

    /// Grace period for in-flight keys on shutdown.
    #[serde(with = "duration_ms", rename = "drain_timeout_ms")]
    pub drain_timeout: Duration,

    /// Consecutive failures after which a key is reported as a standing condition.
    pub standing_condition_after: u32,

    pub rate_limit: RateLimitConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            cache_sync_timeout: Duration::from_secs(30),
            resync_period: Duration::from_secs(600),
            drain_timeout: Duration::from_secs(10),
            standing_condition_after: 10,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Requeue backoff and overall retry throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Sustained retries per second across all keys.
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

impl RateLimitConfig {
    /// Build the per-item exponential plus overall bucket limiter.
    #[must_use]
    pub fn limiter(&self) -> MaxOfLimiter<ObjectKey> {
        controller_limiter(self.base_delay, self.max_delay, self.qps, self.burst)
    }
}

impl ControllerConfig {
    /// Load a TOML file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, [`Error::ConfigParse`]
    /// if it is not valid TOML for this schema, and [`Error::InvalidConfig`] if
    /// the values fail validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw).map_err(|e| Error::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CONVERGE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set but not a number.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set but not a number.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &str| -> Result<Option<u64>> {
            lookup(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| Error::invalid_config(format!("{name}='{raw}': {e}")))
                })
                .transpose()
        };

        if let Some(workers) = number("CONVERGE_WORKERS")? {
            self.workers = usize::try_from(workers)
                .map_err(|e| Error::invalid_config(format!("CONVERGE_WORKERS: {e}")))?;
        }
        if let Some(ms) = number("CONVERGE_CACHE_SYNC_TIMEOUT_MS")? {
            self.cache_sync_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = number("CONVERGE_RESYNC_PERIOD_MS")? {
            self.resync_period = Duration::from_millis(ms);
        }
        if let Some(ms) = number("CONVERGE_DRAIN_TIMEOUT_MS")? {
            self.drain_timeout = Duration::from_millis(ms);
        }
        Ok(self)
    }

    /// Set the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the cache sync timeout.
    #[must_use]
    pub const fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    /// Set the resync period.
    #[must_use]
    pub const fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Set the rate limit settings.
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Reject settings the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.cache_sync_timeout.is_zero() {
            return Err(Error::invalid_config("cache_sync_timeout_ms must be positive"));
        }
        let rl = &self.rate_limit;
        if rl.base_delay.is_zero() {
            return Err(Error::invalid_config("rate_limit.base_delay_ms must be positive"));
        }
        if rl.base_delay > rl.max_delay {
            return Err(Error::invalid_config(format!(
                "rate_limit.base_delay_ms ({}) exceeds max_delay_ms ({})",
                rl.base_delay.as_millis(),
                rl.max_delay.as_millis()
            )));
        }
        if !rl.qps.is_finite() || rl.qps <= 0.0 {
            return Err(Error::invalid_config("rate_limit.qps must be positive"));
        }
        if rl.burst == 0 {
            return Err(Error::invalid_config("rate_limit.burst must be at least 1"));
        }
        Ok(())
    }

    /// Informer settings derived from this config.
    #[must_use]
    pub fn informer(&self) -> InformerConfig {
        InformerConfig {
            resync_period: self.resync_period,
            ..InformerConfig::default()
        }
    }
}

/// Serialization helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
